//! Snapshot capture and restore tasks.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cohort_core::GroupId;
use cohort_store::StateStore;

use super::{blocking, remove_temp, CancelToken, Task, TaskOutput};
use crate::app::{StateTransferClient, StateTransferServer};
use crate::error::{Result, SyncError};

/// Where a captured snapshot goes.
pub enum SnapshotTarget {
    /// Shipped to a joining node; the file outlives the task.
    Session,
    /// Persisted in the state store; the file is removed afterwards.
    Store {
        store: Arc<dyn StateStore>,
        group: GroupId,
    },
}

/// Captures the application state into a temp file.
pub struct SnapshotSaveTask {
    server: Arc<dyn StateTransferServer>,
    file: PathBuf,
    target: SnapshotTarget,
}

impl SnapshotSaveTask {
    pub fn new(server: Arc<dyn StateTransferServer>, file: PathBuf, target: SnapshotTarget) -> Self {
        Self {
            server,
            file,
            target,
        }
    }
}

#[async_trait]
impl Task for SnapshotSaveTask {
    fn name(&self) -> &'static str {
        match self.target {
            SnapshotTarget::Session => "snapshot-save",
            SnapshotTarget::Store { .. } => "snapshot-store",
        }
    }

    async fn execute(&mut self, _token: &CancelToken) -> Result<TaskOutput> {
        let server = Arc::clone(&self.server);
        let file = self.file.clone();
        let saved = match blocking(move || server.save_snapshot(&file)).await {
            Ok(saved) => saved.map_err(|e| {
                SyncError::TransportError(format!(
                    "failed to save snapshot to {}: {e}",
                    self.file.display()
                ))
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            remove_temp(&self.file);
            return Err(e);
        }

        match &self.target {
            SnapshotTarget::Session => Ok(TaskOutput::SnapshotSaved {
                file: Some(self.file.clone()),
            }),
            SnapshotTarget::Store { store, group } => {
                let stored = store.save(group, &self.file).await;
                remove_temp(&self.file);
                stored.map_err(|e| {
                    SyncError::TransportError(format!("failed to store snapshot of {group}: {e}"))
                })?;
                Ok(TaskOutput::SnapshotSaved { file: None })
            }
        }
    }
}

/// Applies a received snapshot and deletes it.
pub struct SnapshotLoadTask {
    client: Arc<dyn StateTransferClient>,
    file: PathBuf,
}

impl SnapshotLoadTask {
    pub fn new(client: Arc<dyn StateTransferClient>, file: PathBuf) -> Self {
        Self { client, file }
    }
}

#[async_trait]
impl Task for SnapshotLoadTask {
    fn name(&self) -> &'static str {
        "snapshot-load"
    }

    async fn execute(&mut self, _token: &CancelToken) -> Result<TaskOutput> {
        let client = Arc::clone(&self.client);
        let file = self.file.clone();
        let loaded = blocking(move || client.load_snapshot(&file)).await;
        remove_temp(&self.file);
        loaded?.map_err(|e| {
            SyncError::TransportError(format!(
                "failed to load snapshot from {}: {e}",
                self.file.display()
            ))
        })?;
        Ok(TaskOutput::SnapshotLoaded)
    }
}

/// Restores the group state kept in the state store, if any.
pub struct StoreStateLoadTask {
    store: Arc<dyn StateStore>,
    group: GroupId,
    client: Arc<dyn StateTransferClient>,
    file: PathBuf,
}

impl StoreStateLoadTask {
    pub fn new(
        store: Arc<dyn StateStore>,
        group: GroupId,
        client: Arc<dyn StateTransferClient>,
        file: PathBuf,
    ) -> Self {
        Self {
            store,
            group,
            client,
            file,
        }
    }

    async fn restore(&self) -> Result<bool> {
        if !self.store.load(&self.group, &self.file).await? {
            return Ok(false);
        }
        let client = Arc::clone(&self.client);
        let file = self.file.clone();
        blocking(move || client.load_snapshot(&file))
            .await?
            .map_err(|e| {
                SyncError::TransportError(format!("failed to restore {}: {e}", self.group))
            })?;
        Ok(true)
    }
}

#[async_trait]
impl Task for StoreStateLoadTask {
    fn name(&self) -> &'static str {
        "store-state-load"
    }

    async fn execute(&mut self, _token: &CancelToken) -> Result<TaskOutput> {
        let restored = self.restore().await;
        remove_temp(&self.file);
        Ok(TaskOutput::StoreStateLoaded { found: restored? })
    }
}
