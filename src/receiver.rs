//! Receiver side of the transfer protocol
//!
//! Serves one connection through the HELLO → OFFER → ACCEPT → DATA* →
//! DONE exchange, streaming bytes into a locked partial file and
//! finalizing only after the digest verifies.

use std::fs::{self, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::errors::{self, ErrorKind};
use crate::hashing::{self, TransferHasher};
use crate::logger::{Logger, NoopLogger};
use crate::progress::Reporter;
use crate::protocol::frame;
use crate::resume::{self, Meta, MetaState, TransferPaths};
use crate::wire::{self, Offer};

/// Bytes of new data between periodic sidecar refreshes.
const META_UPDATE_BYTES: u64 = 4 * 1024 * 1024;

/// Asks whether to accept a transfer: (name, size, peer) → decision.
pub type PromptFn = Box<dyn Fn(&str, u64, &str) -> Result<bool> + Send>;
/// Cleanup returned by the on-listening hook, invoked when serving ends.
pub type StopListening = Box<dyn FnOnce() + Send>;
/// Invoked with the bound address once the receiver is listening.
pub type OnListeningFn = Box<dyn FnOnce(SocketAddr) -> Result<StopListening> + Send>;

/// Receiver behavior configuration.
pub struct ReceiverOptions {
    pub listen: String,
    pub out_dir: PathBuf,
    pub overwrite: bool,
    pub auto_accept: bool,
    pub prompt: Option<PromptFn>,
    pub resume: bool,
    pub keep_partial: bool,
    pub force_restart: bool,
    pub break_lock: bool,
    pub progress: bool,
    pub out: Box<dyn Write + Send>,
    pub logger: Arc<dyn Logger>,
    pub on_listening: Option<OnListeningFn>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            listen: String::new(),
            out_dir: PathBuf::new(),
            overwrite: false,
            auto_accept: false,
            prompt: None,
            resume: false,
            keep_partial: false,
            force_restart: false,
            break_lock: false,
            progress: false,
            out: Box::new(std::io::sink()),
            logger: Arc::new(NoopLogger),
            on_listening: None,
        }
    }
}

/// Listen and serve one incoming transfer.
pub fn receive_once(mut opts: ReceiverOptions) -> Result<()> {
    if opts.listen.is_empty() || opts.out_dir.as_os_str().is_empty() {
        return Err(errors::tag(
            ErrorKind::Usage,
            "missing required receiver options",
        ));
    }
    create_out_dir(&opts.out_dir)?;
    let listener = TcpListener::bind(&opts.listen)
        .map_err(|e| errors::tag(ErrorKind::Network, format!("listen on {}: {e}", opts.listen)))?;
    let local = listener
        .local_addr()
        .map_err(|e| errors::tag(ErrorKind::Network, format!("resolve listen address: {e}")))?;

    let mut stop_listening = None;
    if let Some(hook) = opts.on_listening.take() {
        stop_listening = Some(hook(local).context("receiver on-listening callback")?);
    }
    let _ = writeln!(opts.out, "listening on {local}");

    let result = match listener.accept() {
        Ok((stream, _)) => handle_connection(stream, opts),
        Err(e) => Err(errors::tag(
            ErrorKind::Network,
            format!("accept connection: {e}"),
        )),
    };
    if let Some(stop) = stop_listening {
        stop();
    }
    result
}

fn create_out_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .map_err(|e| errors::tag(ErrorKind::Io, format!("create output dir: {e}")))?;
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
            .map_err(|e| errors::tag(ErrorKind::Io, format!("create output dir: {e}")))?;
    }
    Ok(())
}

/// Removes partial+meta on drop unless disarmed or told to preserve.
struct StateCleanup {
    partial: PathBuf,
    meta: PathBuf,
    keep: bool,
    preserve: bool,
    armed: bool,
}

impl StateCleanup {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StateCleanup {
    fn drop(&mut self) {
        if self.armed && !self.keep && !self.preserve {
            let _ = fs::remove_file(&self.partial);
            let _ = fs::remove_file(&self.meta);
        }
    }
}

/// Best-effort ERROR frame so the peer learns why we are closing.
fn send_error_frame<W: Write>(w: &mut W, msg: &str) {
    let clipped: String = msg.chars().take(512).collect();
    if let Ok(payload) = wire::encode_error(&clipped) {
        let _ = wire::write_frame(w, frame::ERROR, &payload);
        let _ = w.flush();
    }
}

/// Read one frame, reporting malformed ones to the peer before failing.
/// Transport failures classify as network errors.
fn read_frame_reported<R: std::io::Read, W: Write>(
    r: &mut R,
    w: &mut W,
    what: &str,
) -> Result<wire::Frame> {
    match wire::read_frame(r) {
        Ok(frame) => Ok(frame),
        Err(e) => {
            if errors::kind_of(&e) == Some(ErrorKind::InvalidProtocol) {
                send_error_frame(w, &format!("{e:#}"));
            }
            Err(errors::tag_fallback(e, ErrorKind::Network, what))
        }
    }
}

/// Serve one accepted connection transfer session.
pub fn handle_connection(stream: TcpStream, mut opts: ReceiverOptions) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|e| errors::tag(ErrorKind::Network, format!("clone stream: {e}")))?,
    );
    let mut writer = BufWriter::new(stream);

    let hello = read_frame_reported(&mut reader, &mut writer, "read hello frame")?;
    if hello.frame_type != frame::HELLO {
        send_error_frame(&mut writer, "expected HELLO frame");
        return Err(errors::tag(
            ErrorKind::InvalidProtocol,
            format!("expected HELLO, got {}", hello.frame_type),
        ));
    }
    let offer_frame = read_frame_reported(&mut reader, &mut writer, "read offer frame")?;
    if offer_frame.frame_type != frame::OFFER {
        send_error_frame(&mut writer, "expected OFFER frame");
        return Err(errors::tag(
            ErrorKind::InvalidProtocol,
            format!("expected OFFER, got {}", offer_frame.frame_type),
        ));
    }
    let offer = match wire::decode_offer(&offer_frame.payload) {
        Ok(offer) => offer,
        Err(e) => {
            send_error_frame(&mut writer, "invalid offer payload");
            return Err(e.context("decode offer"));
        }
    };
    opts.logger.session_start("recv", &offer.name, offer.size, &peer);

    let accepted = if opts.auto_accept {
        true
    } else if let Some(prompt) = opts.prompt.as_ref() {
        match prompt(&offer.name, offer.size, &peer) {
            Ok(choice) => choice,
            Err(e) => {
                send_error_frame(&mut writer, "receiver prompt failed");
                return Err(e.context("prompt accept transfer"));
            }
        }
    } else {
        false
    };
    if !accepted {
        send_error_frame(&mut writer, "transfer rejected");
        return Err(errors::tag(
            ErrorKind::Rejected,
            "transfer rejected by receiver",
        ));
    }

    let paths = match resume::resolve_paths(&opts.out_dir, &offer.name, opts.overwrite) {
        Ok(paths) => paths,
        Err(e) => {
            send_error_frame(&mut writer, "unable to resolve output path");
            return Err(e.context("resolve output paths"));
        }
    };
    let mut lock = match resume::acquire_lock(&paths.lock, &offer.session_id, &peer, opts.break_lock)
    {
        Ok(lock) => lock,
        Err(e) => {
            send_error_frame(&mut writer, &format!("{e:#}"));
            return Err(e);
        }
    };

    let partial_len = match fs::metadata(&paths.partial) {
        Ok(m) => Some(m.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(errors::tag(
                ErrorKind::Io,
                format!("stat partial file: {e}"),
            ))
        }
    };
    let meta_state = resume::read_meta_state(&paths.meta);
    let plan = match plan_resume(
        partial_len,
        &meta_state,
        &offer,
        opts.resume,
        opts.force_restart,
    ) {
        Ok(plan) => plan,
        Err(e) => {
            send_error_frame(&mut writer, &format!("{e:#}"));
            return Err(e);
        }
    };
    apply_resume_plan(&paths, &plan)?;
    let resume_offset = plan.offset;
    if resume_offset > 0 {
        let pct = (resume_offset as f64 / offer.size as f64) * 100.0;
        let _ = writeln!(opts.out, "Resuming at offset {resume_offset} ({pct:.2}%)");
        opts.logger.resume(&offer.name, resume_offset);
    }

    let accept_payload = wire::encode_accept(resume_offset, &offer.session_id)?;
    wire::write_frame(&mut writer, frame::ACCEPT, &accept_payload).context("send accept frame")?;
    writer
        .flush()
        .map_err(|e| errors::tag(ErrorKind::Network, format!("flush accept frame: {e}")))?;

    let mut cleanup = StateCleanup {
        partial: paths.partial.clone(),
        meta: paths.meta.clone(),
        keep: opts.keep_partial,
        preserve: false,
        armed: true,
    };
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&paths.partial)
        .map_err(|e| errors::tag(ErrorKind::Io, format!("open partial output file: {e}")))?;
    file.seek(SeekFrom::Start(resume_offset))
        .map_err(|e| errors::tag(ErrorKind::Io, format!("seek partial output file: {e}")))?;

    let mut meta = Meta {
        version: resume::META_VERSION,
        expected_size: offer.size,
        received_offset: resume_offset,
        original_name: offer.name.clone(),
        session_id: offer.session_id.clone(),
    };
    resume::save_meta_atomic(&paths.meta, &meta).context("write initial resume metadata")?;

    let mut hasher = TransferHasher::new();
    let reporter = Reporter::new("receiving", offer.size, opts.progress);
    let mut written = resume_offset;
    let mut last_meta_sync = resume_offset;
    while written < offer.size {
        let data = match read_frame_reported(&mut reader, &mut writer, "read data frame") {
            Ok(frame) => frame,
            Err(e) => {
                // A malformed frame is a protocol rejection, not an
                // interruption worth resuming.
                if opts.resume && errors::kind_of(&e) != Some(ErrorKind::InvalidProtocol) {
                    cleanup.preserve = true;
                }
                return Err(e);
            }
        };
        match data.frame_type {
            frame::DATA => {}
            frame::ERROR => {
                let msg = wire::decode_error(&data.payload)
                    .unwrap_or_else(|_| "unreadable error payload".to_string());
                if opts.resume {
                    cleanup.preserve = true;
                }
                opts.logger.error("streaming", &msg);
                return Err(errors::tag(
                    ErrorKind::Network,
                    format!("sender reported error: {msg}"),
                ));
            }
            other => {
                send_error_frame(&mut writer, "expected DATA frame");
                return Err(errors::tag(
                    ErrorKind::InvalidProtocol,
                    format!("expected DATA frame, got {other}"),
                ));
            }
        }
        if data.payload.is_empty() {
            send_error_frame(&mut writer, "empty DATA frame");
            return Err(errors::tag(ErrorKind::InvalidProtocol, "empty DATA frame"));
        }
        if written + data.payload.len() as u64 > offer.size {
            send_error_frame(&mut writer, "received more data than offered");
            return Err(errors::tag(
                ErrorKind::InvalidProtocol,
                "received more bytes than expected",
            ));
        }
        file.write_all(&data.payload)
            .map_err(|e| errors::tag(ErrorKind::Io, format!("write output file: {e}")))?;
        if resume_offset == 0 {
            // With a resumed offset the live hasher cannot cover bytes
            // already on disk; the whole partial is rehashed at verify.
            hasher.update(&data.payload);
        }
        written += data.payload.len() as u64;
        reporter.update(written);
        if written - last_meta_sync >= META_UPDATE_BYTES {
            meta.received_offset = written;
            resume::save_meta_atomic(&paths.meta, &meta)
                .context("periodic resume metadata update")?;
            last_meta_sync = written;
        }
    }
    meta.received_offset = written;
    resume::save_meta_atomic(&paths.meta, &meta).context("final resume metadata update")?;

    let done = match read_frame_reported(&mut reader, &mut writer, "read done frame") {
        Ok(frame) => frame,
        Err(e) => {
            if opts.resume && errors::kind_of(&e) != Some(ErrorKind::InvalidProtocol) {
                cleanup.preserve = true;
            }
            return Err(e);
        }
    };
    if done.frame_type != frame::DONE {
        send_error_frame(&mut writer, "expected DONE frame");
        return Err(errors::tag(
            ErrorKind::InvalidProtocol,
            format!("expected DONE, got {}", done.frame_type),
        ));
    }
    let expected = wire::decode_done(&done.payload).context("decode done payload")?;

    file.sync_all()
        .map_err(|e| errors::tag(ErrorKind::Io, format!("sync output file: {e}")))?;
    drop(file);

    let actual = if resume_offset > 0 {
        hashing::hash_file(&paths.partial).context("rehash resumed file")?
    } else {
        hasher.finalize()
    };
    if !hashing::digests_match(&expected, &actual) {
        send_error_frame(&mut writer, "integrity check failed");
        if !opts.keep_partial {
            let _ = fs::remove_file(&paths.partial);
            let _ = fs::remove_file(&paths.meta);
        }
        cleanup.disarm();
        opts.logger.error("verify", "integrity check failed");
        return Err(errors::tag(ErrorKind::Integrity, "integrity check failed"));
    }

    resume::finalize(&paths).context("finalize partial file")?;
    cleanup.disarm();
    lock.release();
    reporter.finish();

    let digest_hex = hashing::to_hex(&actual);
    let _ = writeln!(opts.out, "Transfer complete.");
    let _ = writeln!(opts.out, "Integrity verified.");
    let _ = writeln!(opts.out, "sha256: {digest_hex}");
    opts.logger.complete(&offer.name, written, &digest_hex);
    Ok(())
}

/// How pre-existing on-disk state is treated for an arriving offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResumePlan {
    pub offset: u64,
    pub remove_partial: bool,
    pub remove_meta: bool,
    pub truncate_partial_to: Option<u64>,
}

impl ResumePlan {
    fn fresh() -> Self {
        Self {
            offset: 0,
            remove_partial: false,
            remove_meta: false,
            truncate_partial_to: None,
        }
    }
}

/// Pure resume decision: given the observed partial length, sidecar state
/// and the incoming offer, decide where to start and what to discard.
pub(crate) fn plan_resume(
    partial_len: Option<u64>,
    meta: &MetaState,
    offer: &Offer,
    resume_enabled: bool,
    force_restart: bool,
) -> Result<ResumePlan> {
    if !resume_enabled {
        return Ok(ResumePlan {
            remove_partial: true,
            remove_meta: true,
            ..ResumePlan::fresh()
        });
    }
    let Some(partial_len) = partial_len else {
        return match meta {
            MetaState::Missing => Ok(ResumePlan::fresh()),
            // A lone sidecar carries nothing worth resuming.
            _ => Ok(ResumePlan {
                remove_meta: true,
                ..ResumePlan::fresh()
            }),
        };
    };
    let meta = match meta {
        MetaState::Missing => {
            return Ok(ResumePlan {
                truncate_partial_to: Some(0),
                ..ResumePlan::fresh()
            });
        }
        MetaState::Corrupt => {
            return Ok(ResumePlan {
                truncate_partial_to: Some(0),
                remove_meta: true,
                ..ResumePlan::fresh()
            });
        }
        MetaState::Loaded(meta) => meta,
    };
    if meta.session_id != offer.session_id {
        if !force_restart {
            return Err(errors::tag(ErrorKind::Rejected, "resume session mismatch"));
        }
        return Ok(ResumePlan {
            remove_partial: true,
            remove_meta: true,
            ..ResumePlan::fresh()
        });
    }
    if meta.expected_size != offer.size {
        if !force_restart {
            return Err(errors::tag(ErrorKind::Rejected, "resume size mismatch"));
        }
        return Ok(ResumePlan {
            remove_partial: true,
            remove_meta: true,
            ..ResumePlan::fresh()
        });
    }
    let truncate_partial_to = (partial_len > offer.size).then_some(offer.size);
    let effective_len = partial_len.min(offer.size);
    Ok(ResumePlan {
        offset: meta.received_offset.min(effective_len),
        remove_partial: false,
        remove_meta: false,
        truncate_partial_to,
    })
}

fn apply_resume_plan(paths: &TransferPaths, plan: &ResumePlan) -> Result<()> {
    if plan.remove_partial {
        let _ = fs::remove_file(&paths.partial);
    }
    if let Some(len) = plan.truncate_partial_to {
        let file = OpenOptions::new()
            .write(true)
            .open(&paths.partial)
            .map_err(|e| errors::tag(ErrorKind::Io, format!("open partial for truncate: {e}")))?;
        file.set_len(len)
            .map_err(|e| errors::tag(ErrorKind::Io, format!("truncate partial file: {e}")))?;
    }
    if plan.remove_meta {
        let _ = fs::remove_file(&paths.meta);
    }
    Ok(())
}
