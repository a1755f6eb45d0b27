//! Storage error types

use thiserror::Error;

/// Errors raised by the durable session store
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection or query failure
    #[error("Database error: {0}")]
    Connection(#[from] rusqlite::Error),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or corrupted stored data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
