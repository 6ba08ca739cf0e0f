//! Error types for the Lucerna library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`LucernaError`] enum. Errors are never recovered from inside the engine:
//! they unwind to the caller with enough context (file name, term, document
//! number) to diagnose the problem.
//!
//! # Examples
//!
//! ```
//! use lucerna::error::{LucernaError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(LucernaError::invalid_argument("unknown field: title"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Lucerna operations.
#[derive(Error, Debug)]
pub enum LucernaError {
    /// Stream read/write/seek failure reported by the device or OS.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// Read past the logical end of a stream.
    ///
    /// Kept apart from [`LucernaError::Io`] because it points at a length or
    /// offset bug or a truncated file rather than a device fault.
    #[error("Read past EOF: {0}")]
    Eof(String),

    /// A lock could not be obtained within the configured timeout.
    #[error("Lock obtain failed: {0}")]
    Lock(String),

    /// Operation is not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    State(String),

    /// Invalid caller input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not supported by this storage or stream implementation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// An on-disk structure failed an internal consistency check.
    #[error("Index corrupted: {0}")]
    Corrupt(String),

    /// Storage-level bookkeeping errors (missing files and the like).
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization errors (configuration).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for operations that may fail with LucernaError.
pub type Result<T> = std::result::Result<T, LucernaError>;

impl From<io::Error> for LucernaError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            LucernaError::Eof(err.to_string())
        } else {
            LucernaError::Io(err)
        }
    }
}

impl LucernaError {
    /// Create a new EOF error.
    pub fn eof<S: Into<String>>(msg: S) -> Self {
        LucernaError::Eof(msg.into())
    }

    /// Create a new lock error.
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        LucernaError::Lock(msg.into())
    }

    /// Create a new state error.
    pub fn state<S: Into<String>>(msg: S) -> Self {
        LucernaError::State(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        LucernaError::InvalidArgument(msg.into())
    }

    /// Create a new unsupported operation error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        LucernaError::Unsupported(msg.into())
    }

    /// Create a new corruption error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        LucernaError::Corrupt(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        LucernaError::Storage(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        LucernaError::InvalidArgument(format!("Invalid configuration: {}", msg.into()))
    }

    /// Whether this error is a lock acquisition failure.
    pub fn is_lock_error(&self) -> bool {
        matches!(self, LucernaError::Lock(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = LucernaError::corrupt("term out of order in _0.tis");
        assert_eq!(
            error.to_string(),
            "Index corrupted: term out of order in _0.tis"
        );

        let error = LucernaError::lock("write.lock");
        assert_eq!(error.to_string(), "Lock obtain failed: write.lock");
        assert!(error.is_lock_error());

        let error = LucernaError::state("reader is closed");
        assert_eq!(error.to_string(), "Invalid state: reader is closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        match LucernaError::from(io_error) {
            LucernaError::Io(_) => {}
            other => panic!("Expected IO error variant, got {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_eof_maps_to_eof() {
        let io_error = io::Error::new(io::ErrorKind::UnexpectedEof, "failed to fill whole buffer");
        match LucernaError::from(io_error) {
            LucernaError::Eof(_) => {}
            other => panic!("Expected EOF variant, got {other:?}"),
        }
    }
}
