//! Transfer event logging

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;

/// Transfer event sink. Implementations must tolerate concurrent calls.
pub trait Logger: Send + Sync {
    fn session_start(&self, _direction: &str, _name: &str, _size: u64, _peer: &str) {}
    fn resume(&self, _name: &str, _offset: u64) {}
    fn complete(&self, _name: &str, _bytes: u64, _digest_hex: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Appends one timestamped line per event to a log file.
pub struct TextLogger {
    sink: Mutex<fs::File>,
}

impl TextLogger {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open transfer log {}", path.display()))?;
        Ok(Self {
            sink: Mutex::new(file),
        })
    }

    fn record(&self, event: fmt::Arguments<'_>) {
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        let _ = writeln!(sink, "[{}] {event}", Utc::now().to_rfc3339());
    }
}

impl Logger for TextLogger {
    fn session_start(&self, direction: &str, name: &str, size: u64, peer: &str) {
        self.record(format_args!(
            "START dir={direction} name={name} size={size} peer={peer}"
        ));
    }
    fn resume(&self, name: &str, offset: u64) {
        self.record(format_args!("RESUME name={name} offset={offset}"));
    }
    fn complete(&self, name: &str, bytes: u64, digest_hex: &str) {
        self.record(format_args!(
            "DONE name={name} bytes={bytes} sha256={digest_hex}"
        ));
    }
    fn error(&self, context: &str, msg: &str) {
        self.record(format_args!("ERROR ctx={context} msg={msg}"));
    }
}
