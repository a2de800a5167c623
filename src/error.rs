//! Error types for the Stowage library
//!
//! Every fallible operation returns [`Result<T>`]. The variants fall into two
//! groups: the structural kinds the engine itself raises (`NotFound`,
//! `Corrupt`, `UnsupportedOperation`, `InvalidState`, `Aborted`) and transport
//! errors wrapped from the crates underneath (I/O, JSON, bincode, crypto).
//!
//! Integrity failures detected by `verify`/`full_verify` are not errors; those
//! operations return `false` instead.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Stowage library
pub type Result<T> = std::result::Result<T, StowageError>;

/// Main error type for all Stowage operations
#[derive(Debug, Error)]
pub enum StowageError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Archive, version or source path missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Trailer, length field, manifest or forest malformed
    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    /// Requested behavior is reserved or not implemented on this platform
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// An internal enumerated value fell outside its defined set
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Key wrapping, unwrapping or authenticated decryption failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// An error reporter chose to abort the operation
    #[error("Operation aborted: {0}")]
    Aborted(String),

    /// Attribute read failure for a single filesystem object
    #[error("Cannot read attributes of {path:?}: {source}")]
    Attributes {
        /// Path of the object
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for StowageError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StowageError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StowageError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StowageError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for StowageError {
    fn from(err: globset::Error) -> Self {
        StowageError::InvalidPattern(err.to_string())
    }
}

impl StowageError {
    /// Create a corruption error with a custom message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        StowageError::Corrupt(msg.into())
    }

    /// Create a not-found error with a custom message
    pub fn not_found(msg: impl Into<String>) -> Self {
        StowageError::NotFound(msg.into())
    }

    /// Create an invalid-state error with a custom message
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        StowageError::InvalidState(msg.into())
    }

    /// Create an unsupported-operation error with a custom message
    pub fn unsupported(msg: impl Into<String>) -> Self {
        StowageError::UnsupportedOperation(msg.into())
    }

    /// Create a crypto error with a custom message
    pub fn crypto(msg: impl Into<String>) -> Self {
        StowageError::Crypto(msg.into())
    }

    /// Check if this error indicates a damaged archive
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StowageError::Corrupt(_) | StowageError::Bincode(_) | StowageError::Crypto(_)
        )
    }

    /// Check if this error must never be downgraded by an error reporter
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StowageError::UnsupportedOperation(_)
                | StowageError::InvalidState(_)
                | StowageError::Aborted(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            StowageError::NotFound(what) => {
                format!("{} not found. Use 'stowage show versions' to list available versions.", what)
            }
            StowageError::Crypto(msg) => {
                format!("Crypto error: {}. Check that the right key file was passed with --key.", msg)
            }
            StowageError::Corrupt(msg) => {
                format!("Archive is damaged ({}). Run 'stowage verify --full' to locate the bad version.", msg)
            }
            _ => self.to_string(),
        }
    }
}

/// Convert an I/O error raised inside a codec back into a crate error
///
/// Codec layers report authentication and framing failures as
/// `InvalidData`; those are corruption, not transport problems.
pub(crate) fn from_codec_io(err: std::io::Error) -> StowageError {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            StowageError::Corrupt(err.to_string())
        }
        _ => StowageError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StowageError::not_found("version 3");
        assert_eq!(err.to_string(), "Not found: version 3");
    }

    #[test]
    fn test_error_fatal() {
        assert!(StowageError::unsupported("rsync").is_fatal());
        assert!(StowageError::invalid_state("mode").is_fatal());
        assert!(!StowageError::corrupt("trailer").is_fatal());
    }

    #[test]
    fn test_error_corruption() {
        assert!(StowageError::corrupt("bad length").is_corruption());
        assert!(!StowageError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "test"
        ))
        .is_corruption());
    }

    #[test]
    fn test_codec_io_mapping() {
        let err = from_codec_io(std::io::Error::new(std::io::ErrorKind::InvalidData, "tag"));
        assert!(err.is_corruption());
        let err = from_codec_io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "x"));
        assert!(matches!(err, StowageError::Io(_)));
    }
}
