//! Error types for a cohort node.

use cohort_core::CoreError;
use cohort_store::StoreError;
use cohort_sync::SyncError;
use thiserror::Error;

/// Errors that can occur while running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The node's event loop is no longer running.
    #[error("node stopped")]
    Stopped,
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
