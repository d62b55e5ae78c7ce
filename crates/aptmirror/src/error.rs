//! Mirror error taxonomy

use aptmirror_common::CommonError;
use thiserror::Error;

/// Result type alias for mirror operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Origin unreachable or answered with a retryable status
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Any object store call that failed
    #[error("Store error on {key}: {message}")]
    Store { key: String, message: String },

    #[error("Digest mismatch for {key}: expected {expected}, got {actual}")]
    DigestMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Size mismatch for {key}: expected {expected}, got {actual}")]
    SizeMismatch { key: String, expected: u64, actual: u64 },

    /// Rollback could not restore the pre-batch state. Operator action required.
    #[error("Mirror is corrupt at {key}: {message}")]
    CorruptMirror { key: String, message: String },

    #[error("Malformed index record in {source_name}: {message}")]
    MalformedRecord { source_name: String, message: String },

    #[error("{what} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        what: String,
        attempts: u32,
        last: Box<SyncError>,
    },

    #[error("Cancelled by error signal: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl SyncError {
    pub fn network(url: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Network {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn store(key: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Store {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn digest_mismatch(
        key: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        SyncError::DigestMismatch {
            key: key.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network { .. }
                | SyncError::Store { .. }
                | SyncError::DigestMismatch { .. }
                | SyncError::SizeMismatch { .. }
                | SyncError::Io(_)
        )
    }

    pub fn is_corrupt_mirror(&self) -> bool {
        match self {
            SyncError::CorruptMirror { .. } => true,
            SyncError::RetriesExhausted { last, .. } => last.is_corrupt_mirror(),
            _ => false,
        }
    }
}
