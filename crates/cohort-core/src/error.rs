//! Error types for cohort core.

use thiserror::Error;

/// Errors raised while constructing core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid membership: {0}")]
    InvalidMembership(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
