//! Crash-safe resume state: path resolution, metadata sidecar, writer lock

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::{self, ErrorKind};
use crate::sanitize;

/// Resume metadata schema version. Unknown versions are rejected on load.
pub const META_VERSION: u16 = 1;

/// Suffix for in-flight bytes next to the final path.
pub const PARTIAL_SUFFIX: &str = ".partial";
/// Suffix for the metadata sidecar next to the partial.
pub const META_SUFFIX: &str = ".snapsync";
/// Suffix for the single-writer lock next to the partial.
pub const LOCK_SUFFIX: &str = ".lock";

/// Resolved destination paths for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPaths {
    pub final_path: PathBuf,
    pub partial: PathBuf,
    pub meta: PathBuf,
    pub lock: PathBuf,
}

impl TransferPaths {
    fn for_candidate(dir: &Path, name: &str) -> Self {
        let final_path = dir.join(name);
        let partial = append_suffix(&final_path, PARTIAL_SUFFIX);
        let meta = append_suffix(&partial, META_SUFFIX);
        let lock = append_suffix(&partial, LOCK_SUFFIX);
        Self {
            final_path,
            partial,
            meta,
            lock,
        }
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Find stable destination paths for a transfer.
///
/// Without `overwrite`, a candidate slot is chosen when resume state for it
/// already exists (partial, meta or lock) or when the final path is free;
/// otherwise ` (n)` is inserted before the extension, bounded at 10,000
/// attempts.
pub fn resolve_paths(out_dir: &Path, original_name: &str, overwrite: bool) -> Result<TransferPaths> {
    let safe = sanitize::safe_file_name(original_name);
    let (stem, ext) = sanitize::split_extension(&safe);

    for i in 0..10_000 {
        let name = if i == 0 {
            safe.clone()
        } else {
            format!("{stem} ({i}){ext}")
        };
        let paths = TransferPaths::for_candidate(out_dir, &name);
        if overwrite {
            return Ok(paths);
        }
        if paths.partial.exists() || paths.meta.exists() || paths.lock.exists() {
            return Ok(paths);
        }
        if !paths.final_path.exists() {
            return Ok(paths);
        }
    }
    Err(errors::tag(
        ErrorKind::Io,
        format!("could not resolve output paths for {safe:?}"),
    ))
}

/// Crash-safe transfer progress for one partial file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub version: u16,
    pub expected_size: u64,
    pub received_offset: u64,
    pub original_name: String,
    pub session_id: String,
}

/// Result of reading a sidecar, distinguishing absence from damage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaState {
    Missing,
    Corrupt,
    Loaded(Meta),
}

/// Load a metadata sidecar.
pub fn load_meta(path: &Path) -> Result<Meta> {
    let data = fs::read(path).with_context(|| format!("read meta file {}", path.display()))?;
    let meta: Meta = serde_json::from_slice(&data)
        .map_err(|e| anyhow::anyhow!("decode meta file {}: {e}", path.display()))?;
    if meta.version != META_VERSION {
        anyhow::bail!("unsupported meta version {}", meta.version);
    }
    Ok(meta)
}

/// Read sidecar state for resume planning.
pub fn read_meta_state(path: &Path) -> MetaState {
    if !path.exists() {
        return MetaState::Missing;
    }
    match load_meta(path) {
        Ok(meta) => MetaState::Loaded(meta),
        Err(_) => MetaState::Corrupt,
    }
}

/// Write metadata atomically: temp file in the same directory, fsync,
/// rename over the target. Partial sidecar updates are never visible.
pub fn save_meta_atomic(path: &Path, meta: &Meta) -> Result<()> {
    let mut meta = meta.clone();
    meta.version = META_VERSION;
    let data = serde_json::to_vec(&meta).context("encode meta file")?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("meta path {} has no parent", path.display()))?;
    fs::create_dir_all(dir)
        .map_err(|e| errors::tag(ErrorKind::Io, format!("create meta directory: {e}")))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".snapsync-meta-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| errors::tag(ErrorKind::Io, format!("create meta temp file: {e}")))?;
    tmp.write_all(&data)
        .map_err(|e| errors::tag(ErrorKind::Io, format!("write meta temp file: {e}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| errors::tag(ErrorKind::Io, format!("sync meta temp file: {e}")))?;
    tmp.persist(path)
        .map_err(|e| errors::tag(ErrorKind::Io, format!("rename meta temp file: {e}")))?;
    Ok(())
}

/// An acquired single-writer lock on {final, partial, meta}.
///
/// Released explicitly or on drop; release is idempotent.
#[derive(Debug)]
pub struct TargetLock {
    path: Option<PathBuf>,
}

impl TargetLock {
    pub fn release(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = fs::remove_file(path);
        }
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquire the target lock file with exclusive-create semantics.
///
/// With `break_lock` any existing lock is removed first. On conflict the
/// error carries `LockBusy`.
pub fn acquire_lock(
    path: &Path,
    session_id: &str,
    peer: &str,
    break_lock: bool,
) -> Result<TargetLock> {
    if break_lock {
        let _ = fs::remove_file(path);
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(errors::tag(
                ErrorKind::LockBusy,
                format!("output target is locked: {}", path.display()),
            ));
        }
        Err(e) => {
            return Err(errors::tag(
                ErrorKind::Io,
                format!("create lock file {}: {e}", path.display()),
            ));
        }
    };
    let body = format!(
        "pid={}\ntime={}\nsession={}\npeer={}\n",
        std::process::id(),
        Utc::now().to_rfc3339(),
        session_id,
        peer,
    );
    let _ = file.write_all(body.as_bytes());
    let _ = file.sync_all();
    Ok(TargetLock {
        path: Some(path.to_path_buf()),
    })
}

/// Rename partial to final and remove the sidecar and lock.
///
/// A crash between rename and cleanup leaves only stale sidecars, which
/// the next run discards.
pub fn finalize(paths: &TransferPaths) -> Result<()> {
    fs::rename(&paths.partial, &paths.final_path).map_err(|e| {
        errors::tag(
            ErrorKind::Io,
            format!(
                "rename {} to {}: {e}",
                paths.partial.display(),
                paths.final_path.display()
            ),
        )
    })?;
    let _ = fs::remove_file(&paths.meta);
    let _ = fs::remove_file(&paths.lock);
    Ok(())
}
