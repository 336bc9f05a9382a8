//! Error types for the subscription directory.

use thiserror::Error;

/// Main error type for directory and store operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Store is locked by another connection")]
    Locked,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid subscriber address: {0:?}")]
    InvalidAddress(String),

    #[error("Invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DirectoryError {
    /// Whether this error came from the durable store rather than from caller input.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            DirectoryError::Io(_)
                | DirectoryError::Storage(_)
                | DirectoryError::Locked
                | DirectoryError::InvalidFormat(_)
                | DirectoryError::ChecksumMismatch { .. }
                | DirectoryError::Serialization(_)
                | DirectoryError::Deserialization(_)
                | DirectoryError::Corruption(_)
        )
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(e: serde_json::Error) -> Self {
        DirectoryError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DirectoryError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DirectoryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DirectoryError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DirectoryError::Deserialization(e.to_string())
    }
}

/// Result type for directory operations.
pub type Result<T> = std::result::Result<T, DirectoryError>;
