//! Application error kinds and process exit code mapping

use std::fmt;

/// Stable failure classes carried at the root of error chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("usage error")]
    Usage,
    #[error("transfer rejected")]
    Rejected,
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("network error")]
    Network,
    #[error("io error")]
    Io,
    #[error("integrity check failed")]
    Integrity,
    #[error("output target is locked")]
    LockBusy,
}

/// Build an error classified as `kind` with a contextual message.
///
/// The kind sits at the root of the chain, so any amount of later
/// `.context(...)` wrapping still classifies the same way.
pub fn tag(kind: ErrorKind, msg: impl fmt::Display) -> anyhow::Error {
    anyhow::Error::new(kind).context(msg.to_string())
}

/// Wrap `err` with a message, classifying it as `kind` only when no kind
/// was attached at its origin.
pub fn tag_fallback(err: anyhow::Error, kind: ErrorKind, msg: &str) -> anyhow::Error {
    if kind_of(&err).is_some() {
        err.context(msg.to_string())
    } else {
        tag(kind, format!("{msg}: {err:#}"))
    }
}

/// The kind attached at the origin of the chain, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ErrorKind>().copied())
        .last()
}

/// Map an error to a process exit code.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match kind_of(err) {
        Some(ErrorKind::Usage) => 2,
        Some(ErrorKind::Rejected) | Some(ErrorKind::Integrity) => 3,
        Some(ErrorKind::InvalidProtocol) => 4,
        Some(ErrorKind::Network) => 5,
        Some(ErrorKind::Io) => 6,
        Some(ErrorKind::LockBusy) | None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_kind() {
        let cases = [
            (ErrorKind::Usage, 2),
            (ErrorKind::Rejected, 3),
            (ErrorKind::Integrity, 3),
            (ErrorKind::InvalidProtocol, 4),
            (ErrorKind::Network, 5),
            (ErrorKind::Io, 6),
            (ErrorKind::LockBusy, 1),
        ];
        for (kind, code) in cases {
            assert_eq!(exit_code(&tag(kind, "boom")), code, "{kind:?}");
        }
        assert_eq!(exit_code(&anyhow::anyhow!("unclassified")), 1);
    }

    #[test]
    fn wrapping_preserves_origin_kind() {
        let err = tag(ErrorKind::InvalidProtocol, "bad magic")
            .context("read data frame")
            .context("handle connection");
        assert_eq!(kind_of(&err), Some(ErrorKind::InvalidProtocol));
        assert_eq!(exit_code(&err), 4);
    }

    #[test]
    fn fallback_does_not_override_origin_kind() {
        let origin = tag(ErrorKind::InvalidProtocol, "reserved field must be zero");
        let wrapped = tag_fallback(origin, ErrorKind::Network, "read frame");
        assert_eq!(kind_of(&wrapped), Some(ErrorKind::InvalidProtocol));

        let plain = anyhow::anyhow!("connection reset");
        let wrapped = tag_fallback(plain, ErrorKind::Network, "read frame");
        assert_eq!(kind_of(&wrapped), Some(ErrorKind::Network));
    }

    #[test]
    fn message_carries_context() {
        let err = tag(ErrorKind::LockBusy, "output target is locked by pid 42");
        assert!(format!("{err:#}").contains("pid 42"));
    }
}
