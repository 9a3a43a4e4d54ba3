//! Cross-platform safe filename handling

/// Windows reserved device names, forbidden as bare filenames.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitize a peer-supplied filename for local use.
///
/// Strips any path components, replaces characters that are invalid on
/// common filesystems, trims leading/trailing spaces and dots, suffixes
/// reserved device names, and falls back to `"file"` when nothing is left.
pub fn safe_file_name(name: &str) -> String {
    let trimmed = name.trim();
    let base = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string();
    let mut base: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    base = base.trim_matches([' ', '.']).to_string();
    if base.is_empty() {
        return "file".to_string();
    }
    if RESERVED_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(&base))
    {
        base.push('_');
    }
    base
}

/// Split a filename into (stem, extension-with-dot) for collision suffixing.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_path_components() {
        assert_eq!(safe_file_name("/etc/passwd"), "passwd");
        assert_eq!(safe_file_name("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(safe_file_name("dir/sub/name.txt"), "name.txt");
    }

    #[test]
    fn replaces_invalid_characters() {
        assert_eq!(safe_file_name("a<b>c:d\"e|f?g*h.txt"), "a_b_c_d_e_f_g_h.txt");
    }

    #[test]
    fn trims_spaces_and_dots() {
        assert_eq!(safe_file_name("  name.txt.  "), "name.txt");
        assert_eq!(safe_file_name("...   "), "file");
    }

    #[test]
    fn empty_falls_back() {
        assert_eq!(safe_file_name(""), "file");
        assert_eq!(safe_file_name("///"), "file");
    }

    #[test]
    fn reserved_names_suffixed() {
        assert_eq!(safe_file_name("CON"), "CON_");
        assert_eq!(safe_file_name("aux"), "aux_");
        assert_eq!(safe_file_name("Com7"), "Com7_");
        // A reserved stem with an extension is a different name entirely.
        assert_eq!(safe_file_name("CON.txt"), "CON.txt");
    }

    #[test]
    fn extension_split() {
        assert_eq!(split_extension("movie.mkv"), ("movie", ".mkv"));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_extension("noext"), ("noext", ""));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }
}
