//! Fatal scan errors.
//!
//! Anything in this module aborts the whole session. Recoverable structural
//! problems live in [`crate::outcome::FormatErrorKind`] and limit conditions
//! in [`crate::outcome::LimitReason`]; neither is ever converted into a
//! `ScanError`, and a `ScanError` is never downgraded to a clean verdict.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Error that unwinds an entire scan session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScanError {
    /// Wall-clock deadline passed.
    #[error("scan time limit exceeded")]
    Timeout,

    /// The session (or a per-container) temp directory could not be created.
    #[error("cannot create temporary storage under {path}: {source}")]
    TempStorage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing extracted data to temporary storage failed.
    #[error("failed to write extracted data: {0}")]
    Write(#[source] io::Error),

    /// A top-level input could not be opened or mapped.
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A buffer reservation was refused.
    #[error("out of memory reserving {requested} bytes")]
    OutOfMemory { requested: u64 },
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Timeout => ErrorKind::Timeout,
            ScanError::TempStorage { .. } => ErrorKind::TempStorage,
            ScanError::Write(_) => ErrorKind::Write,
            ScanError::Open { .. } => ErrorKind::Open,
            ScanError::OutOfMemory { .. } => ErrorKind::Memory,
        }
    }
}

/// Copyable classification of [`ScanError`] carried in
/// [`crate::outcome::ScanOutcome::Error`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Timeout = 0,
    TempStorage = 1,
    Write = 2,
    Open = 3,
    Memory = 4,
}

impl ErrorKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::TempStorage => "temp_storage",
            Self::Write => "write",
            Self::Open => "open",
            Self::Memory => "memory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        let io = || io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(ScanError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(ScanError::Write(io()).kind(), ErrorKind::Write);
        assert_eq!(
            ScanError::TempStorage {
                path: PathBuf::from("/nope"),
                source: io(),
            }
            .kind(),
            ErrorKind::TempStorage
        );
        assert_eq!(
            ScanError::OutOfMemory { requested: 1 }.kind(),
            ErrorKind::Memory
        );
    }

    #[test]
    fn display_names_the_path() {
        let err = ScanError::Open {
            path: PathBuf::from("/tmp/sample.bin"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/sample.bin"));
        assert!(msg.contains("missing"));
    }
}
