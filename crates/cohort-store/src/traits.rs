//! StateStore trait: the abstract interface for group snapshot persistence.
//!
//! The coordinator periodically captures the group state into a file and hands
//! it to the store; a forming group restores from it. Implementations include
//! SQLite (primary) and in-memory (for tests).

use std::path::Path;

use async_trait::async_trait;
use cohort_core::GroupId;

use crate::error::Result;

/// Async interface for group snapshot persistence.
///
/// Called from worker tasks, never from the protocol event loop. Blocking
/// backends use `spawn_blocking` internally.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Copy the stored snapshot of `group` into `file`.
    ///
    /// Returns `false` (and leaves `file` untouched) when nothing is stored.
    async fn load(&self, group: &GroupId, file: &Path) -> Result<bool>;

    /// Persist the contents of `file` as the current snapshot of `group`.
    async fn save(&self, group: &GroupId, file: &Path) -> Result<()>;
}
