//! Error types for shipyard-state

use thiserror::Error;

/// Errors that can occur in the deployment history layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying file I/O failed
    #[error("deployment log I/O failed at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A stored line could not be decoded
    #[error("corrupt deployment record at {path}:{line}: {reason}")]
    Corrupt {
        path: String,
        line: usize,
        reason: String,
    },

    /// Record could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
