//! Error types for the acceleration structure decoder.

use std::fmt;
use thiserror::Error;

/// Main error type for decode operations.
///
/// Every variant is recoverable: a failing structure is reported and skipped,
/// the rest of the bundle keeps decoding.
#[derive(Error, Debug)]
pub enum Error {
    /// Magic or ray-tracing IP level not handled by any reader
    #[error("Unsupported structure version: {0}")]
    UnsupportedVersion(String),

    /// A section declared by the header runs past the end of the buffer
    #[error("Buffer truncated: {what} needs {needed} bytes at offset {offset}, {available} available")]
    TruncatedBuffer {
        what: &'static str,
        offset: u64,
        needed: u64,
        available: u64,
    },

    /// Fewer bytes remain than the stride of the record being read
    #[error("Record truncated: {kind} at offset {offset} needs {stride} bytes, {available} available")]
    TruncatedRecord {
        kind: &'static str,
        offset: u64,
        stride: usize,
        available: usize,
    },

    /// Node pointer with an unknown tag or an offset outside the node stream
    #[error("Invalid node pointer 0x{raw:08x}: {reason}")]
    InvalidPointer { raw: u32, reason: String },

    /// Walk finished without resolving every primitive index
    #[error("Incomplete index map: {resolved} of {expected} primitives resolved")]
    IncompleteIndexMap { expected: u32, resolved: u32 },

    /// Instance references a BLAS slot outside the bundle
    #[error("Instance {instance} references BLAS {blas_index}, bundle has {blas_count}")]
    DanglingInstanceReference {
        instance: u32,
        blas_index: u64,
        blas_count: usize,
    },

    /// Tree contains a cycle or a shared child
    #[error("Malformed topology: node at offset {offset} reached twice")]
    MalformedTopology { offset: u64 },

    /// Header counts and section offsets disagree
    #[error("Inconsistent header: {0}")]
    InconsistentHeader(String),

    /// Load was cancelled between structures
    #[error("Decode cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file could not be parsed
    #[error("Invalid settings: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// Fieldless discriminant of [`Error`], handy for matching and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedVersion,
    TruncatedBuffer,
    TruncatedRecord,
    InvalidPointer,
    IncompleteIndexMap,
    DanglingInstanceReference,
    MalformedTopology,
    InconsistentHeader,
    Cancelled,
    Io,
    Json,
    Other,
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an unsupported version error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedVersion(msg.into())
    }

    /// Create an inconsistent header error.
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::InconsistentHeader(msg.into())
    }

    /// Create an invalid pointer error.
    pub fn invalid_pointer(raw: u32, reason: impl Into<String>) -> Self {
        Self::InvalidPointer {
            raw,
            reason: reason.into(),
        }
    }

    /// Discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            Self::TruncatedBuffer { .. } => ErrorKind::TruncatedBuffer,
            Self::TruncatedRecord { .. } => ErrorKind::TruncatedRecord,
            Self::InvalidPointer { .. } => ErrorKind::InvalidPointer,
            Self::IncompleteIndexMap { .. } => ErrorKind::IncompleteIndexMap,
            Self::DanglingInstanceReference { .. } => ErrorKind::DanglingInstanceReference,
            Self::MalformedTopology { .. } => ErrorKind::MalformedTopology,
            Self::InconsistentHeader(_) => ErrorKind::InconsistentHeader,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
            Self::Other(_) => ErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result type alias for decode operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::IncompleteIndexMap { expected: 4, resolved: 3 };
        assert!(e.to_string().contains("3 of 4"));

        let e = Error::invalid_pointer(0xdead_beef, "unknown tag");
        assert!(e.to_string().contains("0xdeadbeef"));
        assert!(e.to_string().contains("unknown tag"));
    }

    #[test]
    fn test_error_kind() {
        let e = Error::TruncatedRecord { kind: "triangle", offset: 256, stride: 64, available: 61 };
        assert_eq!(e.kind(), ErrorKind::TruncatedRecord);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(ErrorKind::MalformedTopology.to_string(), "MalformedTopology");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
