//! Sender side of the transfer protocol

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};

use crate::errors::{self, ErrorKind};
use crate::hashing::{self, TransferHasher};
use crate::logger::{Logger, NoopLogger};
use crate::progress::Reporter;
use crate::protocol::{frame, MAX_CHUNK_SIZE};
use crate::wire::{self, Offer};

/// Mutates an outgoing chunk after hashing; test-only capability used to
/// exercise integrity failure end to end.
pub type ChunkTransform = Box<dyn FnMut(&mut [u8]) + Send>;

/// Sender behavior configuration.
pub struct SenderOptions {
    pub path: PathBuf,
    pub address: String,
    pub override_name: Option<String>,
    pub session_id: Option<String>,
    pub resume: bool,
    pub progress: bool,
    pub out: Box<dyn Write + Send>,
    pub logger: Arc<dyn Logger>,
    pub chunk_transform: Option<ChunkTransform>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            address: String::new(),
            override_name: None,
            session_id: None,
            resume: false,
            progress: false,
            out: Box::new(std::io::sink()),
            logger: Arc::new(NoopLogger),
            chunk_transform: None,
        }
    }
}

/// Stream one file to a receiver.
pub fn send(mut opts: SenderOptions) -> Result<()> {
    if opts.path.as_os_str().is_empty() || opts.address.is_empty() {
        return Err(errors::tag(
            ErrorKind::Usage,
            "missing required sender options",
        ));
    }

    let (mut file, size, send_name) = open_source(&opts.path, opts.override_name.as_deref())?;
    let session_id = match opts.session_id.clone() {
        Some(id) => id,
        None => derive_session_id(&opts.path, size)?,
    };
    opts.logger
        .session_start("send", &send_name, size, &opts.address);

    let stream = TcpStream::connect(&opts.address).map_err(|e| {
        errors::tag(
            ErrorKind::Network,
            format!("dial receiver {}: {e}", opts.address),
        )
    })?;
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|e| errors::tag(ErrorKind::Network, format!("clone stream: {e}")))?,
    );
    let mut writer = BufWriter::new(stream);

    wire::write_frame(&mut writer, frame::HELLO, &[])
        .map_err(|e| errors::tag_fallback(e, ErrorKind::Network, "send hello"))?;
    let offer = Offer {
        name: send_name.clone(),
        size,
        session_id: session_id.clone(),
    };
    let offer_payload = wire::encode_offer(&offer).context("encode offer")?;
    wire::write_frame(&mut writer, frame::OFFER, &offer_payload)
        .map_err(|e| errors::tag_fallback(e, ErrorKind::Network, "send offer"))?;
    writer
        .flush()
        .map_err(|e| errors::tag(ErrorKind::Network, format!("flush offer frames: {e}")))?;

    let response = wire::read_frame(&mut reader)
        .map_err(|e| errors::tag_fallback(e, ErrorKind::Network, "read receiver response"))?;
    let mut resume_offset = match response.frame_type {
        frame::ACCEPT => {
            let (offset, echoed_session) =
                wire::decode_accept(&response.payload).context("decode accept frame")?;
            if echoed_session != session_id {
                return Err(errors::tag(
                    ErrorKind::InvalidProtocol,
                    "accept echoed a different session id",
                ));
            }
            offset
        }
        frame::ERROR => {
            let msg = wire::decode_error(&response.payload)
                .context("decode receiver error frame")?;
            opts.logger.error("handshake", &msg);
            return Err(errors::tag(
                ErrorKind::Rejected,
                format!("receiver rejected transfer: {msg}"),
            ));
        }
        other => {
            return Err(errors::tag(
                ErrorKind::InvalidProtocol,
                format!("unexpected response frame type {other}"),
            ));
        }
    };
    if !opts.resume {
        resume_offset = 0;
    }
    if resume_offset > size {
        return Err(errors::tag(
            ErrorKind::InvalidProtocol,
            format!("receiver resume offset {resume_offset} exceeds file size {size}"),
        ));
    }

    let mut hasher = TransferHasher::new();
    if resume_offset > 0 {
        let pct = (resume_offset as f64 / size as f64) * 100.0;
        let _ = writeln!(opts.out, "Resuming at offset {resume_offset} ({pct:.2}%)");
        opts.logger.resume(&send_name, resume_offset);
        hashing::hash_prefix(&mut file, resume_offset, &mut hasher)?;
    }
    file.seek(SeekFrom::Start(resume_offset))
        .map_err(|e| errors::tag(ErrorKind::Io, format!("seek source file for resume: {e}")))?;

    let reporter = Reporter::new("sending", size, opts.progress);
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    let mut sent = resume_offset;
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| errors::tag(ErrorKind::Io, format!("read source file: {e}")))?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        hasher.update(chunk);
        if let Some(transform) = opts.chunk_transform.as_mut() {
            transform(chunk);
        }
        wire::write_frame(&mut writer, frame::DATA, chunk)
            .map_err(|e| errors::tag_fallback(e, ErrorKind::Network, "send data frame"))?;
        sent += n as u64;
        reporter.update(sent);
    }

    let digest = hasher.finalize();
    let done_payload = wire::encode_done(&digest).context("encode done payload")?;
    wire::write_frame(&mut writer, frame::DONE, &done_payload)
        .map_err(|e| errors::tag_fallback(e, ErrorKind::Network, "send done frame"))?;
    writer
        .flush()
        .map_err(|e| errors::tag(ErrorKind::Network, format!("flush transfer frames: {e}")))?;

    // A clean close after DONE is the receiver's success signal; an ERROR
    // frame is a verdict, anything else is a broken connection.
    match wire::read_frame(&mut reader) {
        Ok(status) if status.frame_type == frame::ERROR => {
            let msg = wire::decode_error(&status.payload)
                .unwrap_or_else(|_| "unreadable error payload".to_string());
            opts.logger.error("completion", &msg);
            return Err(errors::tag(
                ErrorKind::Rejected,
                format!("receiver reported failure: {msg}"),
            ));
        }
        Ok(status) => {
            return Err(errors::tag(
                ErrorKind::Network,
                format!("unexpected completion frame type {}", status.frame_type),
            ));
        }
        Err(e) if !is_clean_eof(&e) => {
            return Err(errors::tag_fallback(
                e,
                ErrorKind::Network,
                "read receiver completion status",
            ));
        }
        Err(_) => {}
    }

    reporter.finish();
    let digest_hex = hashing::to_hex(&digest);
    let _ = writeln!(opts.out, "Transfer complete.");
    let _ = writeln!(opts.out, "Integrity verified.");
    let _ = writeln!(opts.out, "sha256: {digest_hex}");
    opts.logger.complete(&send_name, sent, &digest_hex);
    Ok(())
}

fn is_clean_eof(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
}

fn open_source(path: &Path, override_name: Option<&str>) -> Result<(File, u64, String)> {
    let file = File::open(path)
        .map_err(|e| errors::tag(ErrorKind::Io, format!("open source file: {e}")))?;
    let info = file
        .metadata()
        .map_err(|e| errors::tag(ErrorKind::Io, format!("stat source file: {e}")))?;
    if !info.is_file() {
        return Err(errors::tag(
            ErrorKind::Usage,
            format!("source is not a regular file: {}", path.display()),
        ));
    }
    let name = match override_name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    Ok((file, info.len(), name))
}

/// Default session id: stable across retries of the same logical transfer
/// (same file, same contents-identity), distinct once the file changes.
fn derive_session_id(path: &Path, size: u64) -> Result<String> {
    let abs = path
        .canonicalize()
        .map_err(|e| errors::tag(ErrorKind::Io, format!("canonicalize source path: {e}")))?;
    let mtime = std::fs::metadata(&abs)
        .and_then(|m| m.modified())
        .map_err(|e| errors::tag(ErrorKind::Io, format!("read source mtime: {e}")))?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let mut hasher = TransferHasher::new();
    hasher.update(abs.to_string_lossy().as_bytes());
    hasher.update(&size.to_be_bytes());
    hasher.update(&mtime.to_be_bytes());
    Ok(hashing::to_hex(&hasher.finalize())[..32].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::kind_of;
    use std::fs;

    #[test]
    fn open_source_requires_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_source(dir.path(), None).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Usage));

        let missing = open_source(&dir.path().join("absent"), None).unwrap_err();
        assert_eq!(kind_of(&missing), Some(ErrorKind::Io));
    }

    #[test]
    fn send_name_prefers_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"abc").unwrap();

        let (_, size, name) = open_source(&path, None).unwrap();
        assert_eq!(size, 3);
        assert_eq!(name, "data.bin");

        let (_, _, name) = open_source(&path, Some("renamed.bin")).unwrap();
        assert_eq!(name, "renamed.bin");

        let (_, _, name) = open_source(&path, Some("")).unwrap();
        assert_eq!(name, "data.bin");
    }

    #[test]
    fn session_id_is_stable_until_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"abc").unwrap();

        let a = derive_session_id(&path, 3).unwrap();
        let b = derive_session_id(&path, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.is_ascii());

        let c = derive_session_id(&path, 4).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn missing_options_are_usage_errors() {
        let err = send(SenderOptions::default()).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Usage));

        let err = send(SenderOptions {
            path: PathBuf::from("/tmp/x"),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Usage));
    }
}
