//! Off-loop work: snapshot capture and restore, message log save and replay.
//!
//! Protocols never block the event loop on file I/O. They box a [`Task`],
//! hand it to a [`TaskExecutor`], and keep the returned [`TaskHandle`]. The
//! executor runs the task elsewhere and reports a [`TaskCompletion`] that the
//! loop routes back to the owning protocol by [`TaskId`].
//!
//! Cancellation is cooperative: a canceled task still runs to completion, but
//! its completion is suppressed and whatever temp file it produced is removed.

pub mod executor;
pub mod messages;
pub mod snapshot;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Result, SyncError};

pub use executor::{manual::ManualTaskExecutor, TaskExecutor, TokioTaskExecutor};
pub use messages::{MessageSink, MessagesLoadTask, MessagesSaveTask, ReplayBatch, ReplaySink};
pub use snapshot::{SnapshotLoadTask, SnapshotSaveTask, SnapshotTarget, StoreStateLoadTask};

/// Identifier assigned by the executor, unique per executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Shared cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the token is canceled.
    pub async fn cancelled(&self) {
        let mut state = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = state.wait_for(|canceled| *canceled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The loop-side handle of a dispatched task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    token: CancelToken,
}

impl TaskHandle {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            token: CancelToken::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }
}

/// What a finished task produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    /// Snapshot written. `file` is set for session captures and is owned by
    /// the receiver; store captures leave nothing behind.
    SnapshotSaved { file: Option<PathBuf> },
    /// Snapshot applied to the local application.
    SnapshotLoaded,
    /// Message log written to `file`.
    MessagesSaved { file: PathBuf, count: usize },
    /// Message logs replayed.
    MessagesLoaded { files: usize, messages: usize },
    /// Group state restore attempted; `found` is false when the store was empty.
    StoreStateLoaded { found: bool },
}

impl TaskOutput {
    /// The temp file handed over by this output, if any.
    pub fn file(&self) -> Option<&Path> {
        match self {
            TaskOutput::SnapshotSaved { file } => file.as_deref(),
            TaskOutput::MessagesSaved { file, .. } => Some(file),
            _ => None,
        }
    }

    /// Drop the output, removing any temp file it hands over.
    pub fn discard(self) {
        if let Some(file) = self.file() {
            remove_temp(file);
        }
    }
}

/// A task result delivered back to the event loop.
#[derive(Debug)]
pub struct TaskCompletion {
    pub id: TaskId,
    pub result: Result<TaskOutput>,
}

/// Unit of off-loop work.
#[async_trait]
pub trait Task: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run the task. `token` may be observed to stop early.
    async fn execute(&mut self, token: &CancelToken) -> Result<TaskOutput>;

    /// Release an output whose completion is being suppressed.
    fn discard(&mut self, output: TaskOutput) {
        output.discard();
    }
}

/// Run `f` on the blocking pool.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Worker(e.to_string()))
}

/// Best-effort removal of a temp file.
pub(crate) fn remove_temp(file: &Path) {
    if let Err(e) = std::fs::remove_file(file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(file = %file.display(), error = %e, "failed to remove temp file");
        }
    }
}
