//! Build metadata for the SnapSync binary

use std::fmt;

/// Normalized build metadata. Commit and date are injected at build time
/// via `SNAPSYNC_COMMIT` / `SNAPSYNC_BUILD_DATE` when available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub version: &'static str,
    pub commit: &'static str,
    pub date: &'static str,
    pub os: &'static str,
    pub arch: &'static str,
}

pub fn get() -> Info {
    Info {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("SNAPSYNC_COMMIT").unwrap_or("unknown"),
        date: option_env!("SNAPSYNC_BUILD_DATE").unwrap_or("unknown"),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SnapSync {}\ncommit: {}\nbuilt:  {}\nos/arch: {}/{}",
            self.version, self.commit, self.date, self.os, self.arch
        )
    }
}
