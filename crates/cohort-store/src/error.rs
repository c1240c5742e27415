//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Message serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The file is not a message log or is structurally damaged.
    #[error("invalid log format: {0}")]
    InvalidFormat(String),

    /// Payload checksum does not match the header: the log file is corrupted.
    #[error("log checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Background worker failed.
    #[error("worker error: {0}")]
    Worker(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
