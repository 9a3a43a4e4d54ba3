//! Streaming transfer integrity hashing

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::{self, ErrorKind};
use crate::protocol::{HASH_SIZE, MAX_CHUNK_SIZE};

/// Incremental SHA-256 over the logical file contents.
pub struct TransferHasher {
    inner: Sha256,
}

impl TransferHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Raw 32-byte digest.
    pub fn finalize(self) -> [u8; HASH_SIZE] {
        self.inner.finalize().into()
    }
}

impl Default for TransferHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase hex rendering of a digest.
pub fn to_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time digest comparison. Unequal lengths never match.
pub fn digests_match(expected: &[u8], actual: &[u8]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    expected.ct_eq(actual).into()
}

/// Feed bytes `[0, offset)` of `file` into `hasher`, reading from the start.
///
/// Used when a resumed connection cannot carry hash state for bytes that
/// are already on disk at the far end.
pub fn hash_prefix(file: &mut File, offset: u64, hasher: &mut TransferHasher) -> Result<()> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| errors::tag(ErrorKind::Io, format!("seek file for prefix hash: {e}")))?;
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    let mut remaining = offset;
    while remaining > 0 {
        let want = (buf.len() as u64).min(remaining) as usize;
        file.read_exact(&mut buf[..want])
            .map_err(|e| errors::tag(ErrorKind::Io, format!("read prefix for resume hash: {e}")))?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(())
}

/// Digest of a complete file read sequentially from byte 0.
pub fn hash_file(path: &Path) -> Result<[u8; HASH_SIZE]> {
    let mut file = File::open(path)
        .map_err(|e| errors::tag(ErrorKind::Io, format!("open file for integrity rehash: {e}")))
        .with_context(|| format!("rehash {}", path.display()))?;
    let mut hasher = TransferHasher::new();
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| errors::tag(ErrorKind::Io, format!("read file for rehash: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn digest_of(bytes: &[u8]) -> [u8; HASH_SIZE] {
        let mut h = TransferHasher::new();
        h.update(bytes);
        h.finalize()
    }

    #[test]
    fn split_updates_equal_single_update() {
        let data: Vec<u8> = (0u32..100_000).map(|i| (i % 251) as u8).collect();
        let whole = digest_of(&data);
        for split in [0, 1, 4096, data.len() / 2, data.len()] {
            let mut h = TransferHasher::new();
            h.update(&data[..split]);
            h.update(&data[split..]);
            assert_eq!(h.finalize(), whole, "split at {split}");
        }
    }

    #[test]
    fn known_empty_digest() {
        assert_eq!(
            to_hex(&digest_of(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn prefix_hash_matches_direct_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        let data: Vec<u8> = (0u32..3_000_000).map(|i| (i % 239) as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let offset = 1_234_567u64;
        let mut file = File::open(&path).unwrap();
        let mut hasher = TransferHasher::new();
        hash_prefix(&mut file, offset, &mut hasher).unwrap();
        hasher.update(&data[offset as usize..]);
        assert_eq!(hasher.finalize(), digest_of(&data));
    }

    #[test]
    fn prefix_hash_fails_on_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();
        let mut file = File::open(&path).unwrap();
        let mut hasher = TransferHasher::new();
        assert!(hash_prefix(&mut file, 10, &mut hasher).is_err());
    }

    #[test]
    fn hash_file_matches_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let data = b"0123456789abcdef".repeat(1000);
        std::fs::write(&path, &data).unwrap();
        assert_eq!(hash_file(&path).unwrap(), digest_of(&data));
    }

    #[test]
    fn digest_comparison() {
        let a = digest_of(b"one");
        let b = digest_of(b"two");
        assert!(digests_match(&a, &a));
        assert!(!digests_match(&a, &b));
        assert!(!digests_match(&a, &a[..31]));
    }
}
