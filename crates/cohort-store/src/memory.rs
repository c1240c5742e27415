//! In-memory implementation of the StateStore trait.
//!
//! This is primarily for testing. It keeps every snapshot in memory with no
//! persistence.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cohort_core::GroupId;

use crate::error::{Result, StoreError};
use crate::traits::StateStore;

/// In-memory snapshot store.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    snapshots: Arc<RwLock<HashMap<GroupId, Vec<u8>>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a snapshot directly, bypassing files.
    pub fn insert(&self, group: GroupId, state: Vec<u8>) {
        if let Ok(mut snapshots) = self.snapshots.write() {
            snapshots.insert(group, state);
        }
    }

    /// Stored snapshot bytes for `group`.
    pub fn get(&self, group: &GroupId) -> Option<Vec<u8>> {
        self.snapshots
            .read()
            .ok()
            .and_then(|snapshots| snapshots.get(group).cloned())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, group: &GroupId, file: &Path) -> Result<bool> {
        let Some(state) = self.get(group) else {
            return Ok(false);
        };

        let file = file.to_path_buf();
        tokio::task::spawn_blocking(move || std::fs::write(file, state))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))??;
        Ok(true)
    }

    async fn save(&self, group: &GroupId, file: &Path) -> Result<()> {
        let file = file.to_path_buf();
        let state = tokio::task::spawn_blocking(move || std::fs::read(file))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))??;
        self.insert(group.clone(), state);
        Ok(())
    }
}
