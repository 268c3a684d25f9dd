//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open store: {0}")]
    OpenFailed(String),

    #[error("Corrupt record for key: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn open_failed(msg: impl Into<String>) -> Self {
        Self::OpenFailed(msg.into())
    }

    pub fn corrupt(key: impl Into<String>) -> Self {
        Self::Corrupt(key.into())
    }

    /// True if the stored bytes could not be decoded.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::Corrupt(_) | StorageError::Json(_))
    }
}
