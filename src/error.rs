//! # Error Kinds
//!
//! Recoverable failures carry a typed [`ErrorKind`] as the root cause of
//! the `eyre` report, so callers that need to branch on the failure class
//! can use `report.downcast_ref::<ErrorKind>()` while everything else
//! flows through `eyre::Result` with plain context messages.
//!
//! ## Classification
//!
//! - `NotFound`, `AlreadyExists`, `Locked`, `VersionMismatch`, and
//!   `InvalidArgument` are recoverable at the caller.
//! - `Corrupt` indicates a malformed id/keys/stats file and aborts the
//!   enclosing operation.
//!
//! Plain I/O failures are not wrapped in a kind; they surface as the
//! underlying `std::io::Error` with path context attached.

use std::fmt::Display;

/// Classified failure causes for map and partition operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// No map exists at the given path and creation was not allowed.
    NotFound,
    /// A map already exists and the caller demanded a fresh one.
    AlreadyExists,
    /// The directory lock is held by another process.
    Locked,
    /// The map was created by an incompatible library version.
    VersionMismatch,
    /// Oversize key or value, or an invalid option (zero/odd block size,
    /// zero partitions, write on a read-only map).
    InvalidArgument,
    /// A persistent file is malformed.
    Corrupt,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "map not found"),
            ErrorKind::AlreadyExists => write!(f, "map already exists"),
            ErrorKind::Locked => write!(f, "map directory is locked by another process"),
            ErrorKind::VersionMismatch => write!(f, "incompatible map version"),
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::Corrupt => write!(f, "corrupt map file"),
        }
    }
}

impl std::error::Error for ErrorKind {}

/// Returns the [`ErrorKind`] at the root of a report, if any.
pub fn kind_of(report: &eyre::Report) -> Option<ErrorKind> {
    report.downcast_ref::<ErrorKind>().copied()
}

/// Builds a report whose root cause is the given kind, wrapped with a
/// human-readable context message.
pub fn report(kind: ErrorKind, msg: impl std::fmt::Display) -> eyre::Report {
    eyre::Report::new(kind).wrap_err(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn kind_survives_context_wrapping() {
        let report = eyre::Report::new(ErrorKind::Locked)
            .wrap_err("failed to open map at '/tmp/m'");
        assert_eq!(kind_of(&report), Some(ErrorKind::Locked));
    }

    #[test]
    fn io_errors_have_no_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let report: eyre::Report = io.into();
        let report = report.wrap_err("failed to flush");
        assert_eq!(kind_of(&report), None);
    }
}
