//! Error types for the sync module.

use thiserror::Error;

use cohort_store::StoreError;

/// Errors that can occur during state transfer and data exchange.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation was invoked in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transport-level failure, including snapshot and log I/O during a transfer.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    /// A worker task panicked or was aborted.
    #[error("worker error: {0}")]
    Worker(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
