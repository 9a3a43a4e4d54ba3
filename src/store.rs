//! Tiny local persistence helpers

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Load the persisted local peer id, or generate and persist a new one.
pub fn load_or_create_peer_id(generate: impl FnOnce() -> Result<String>) -> Result<String> {
    load_or_create_peer_id_at(&peer_id_path()?, generate)
}

fn load_or_create_peer_id_at(
    path: &Path,
    generate: impl FnOnce() -> Result<String>,
) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(data) => {
            let id = data.trim().to_string();
            if !id.is_empty() {
                return Ok(id);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("read peer id file {}", path.display())),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create peer id directory {}", parent.display()))?;
    }
    let id = generate().context("generate peer id")?;
    fs::write(path, format!("{id}\n"))
        .with_context(|| format!("write peer id file {}", path.display()))?;
    Ok(id)
}

fn peer_id_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("resolve user config dir")?;
    Ok(base.join("snapsync").join("peer_id"))
}
