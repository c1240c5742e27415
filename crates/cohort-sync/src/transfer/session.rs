//! One state transfer served to one joining node.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use cohort_core::{GroupMembership, LoopBound, Message, MessagePart, NodeId, StateTransferResponse};

use super::TransferContext;
use crate::error::{Result, SyncError};
use crate::task::{
    MessagesSaveTask, SnapshotSaveTask, SnapshotTarget, TaskCompletion, TaskHandle, TaskId,
    TaskOutput,
};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingSnapshot,
    SnapshotSaved,
    Closed,
    Canceled,
    Failed,
}

/// Outcome reported to the server after a session task completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A bundle was shipped; the session continues.
    Progress,
    /// The snapshot was shipped; held back messages may flow again.
    SnapshotSaved,
    /// The final shipment was sent.
    Closed,
    /// A capture failed and the client was told so.
    Failed,
}

/// Creates sessions bound to a node's transfer context.
#[derive(Clone)]
pub struct SessionFactory {
    context: Rc<TransferContext>,
}

impl SessionFactory {
    pub fn new(context: Rc<TransferContext>) -> Self {
        Self { context }
    }

    pub fn create(&self, client: NodeId) -> StateTransferSession {
        StateTransferSession {
            context: Rc::clone(&self.context),
            client,
            state: SessionState::AwaitingSnapshot,
            buffer: Vec::new(),
            window_start: None,
            snapshot_task: None,
            bundle_task: None,
            bundles: 0,
            _loop: LoopBound::new(),
        }
    }
}

/// Server side of a single transfer.
///
/// Ships a snapshot followed by bundles of the state-changing messages applied
/// after it. The last shipment is marked `last` once the client is a member
/// and nothing remains buffered here or in the server.
pub struct StateTransferSession {
    context: Rc<TransferContext>,
    client: NodeId,
    state: SessionState,
    buffer: Vec<Message>,
    window_start: Option<Instant>,
    snapshot_task: Option<TaskHandle>,
    bundle_task: Option<TaskHandle>,
    bundles: usize,
    _loop: LoopBound,
}

impl StateTransferSession {
    pub fn client(&self) -> NodeId {
        self.client
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_snapshot_pending(&self) -> bool {
        self.snapshot_task.is_some()
    }

    pub fn is_bundle_pending(&self) -> bool {
        self.bundle_task.is_some()
    }

    /// Whether applied messages must be recorded for the client.
    pub fn accepts_messages(&self) -> bool {
        self.snapshot_task.is_some() || self.state == SessionState::SnapshotSaved
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SessionState::Closed | SessionState::Canceled | SessionState::Failed
        )
    }

    /// Whether `id` belongs to one of this session's tasks.
    pub fn owns(&self, id: TaskId) -> bool {
        [&self.snapshot_task, &self.bundle_task]
            .into_iter()
            .flatten()
            .any(|handle| handle.id() == id)
    }

    /// Start capturing the snapshot.
    pub fn save_snapshot(&mut self) -> Result<()> {
        if self.state != SessionState::AwaitingSnapshot || self.snapshot_task.is_some() {
            return Err(SyncError::InvalidState(format!(
                "snapshot already requested for {}",
                self.client
            )));
        }
        let file = self.context.temp_file("snapshot");
        let task = SnapshotSaveTask::new(
            Arc::clone(&self.context.server_app),
            file,
            SnapshotTarget::Session,
        );
        self.snapshot_task = Some(self.context.executor.execute(Box::new(task)));
        tracing::debug!(client = %self.client.short(), "session snapshot started");
        Ok(())
    }

    /// Record an applied state-changing message.
    pub fn add_message(&mut self, message: Message, now: Instant) -> Result<()> {
        if !self.accepts_messages() {
            return Err(SyncError::InvalidState(format!(
                "session for {} is not recording messages",
                self.client
            )));
        }
        if self.buffer.is_empty() {
            self.window_start = Some(now);
        }
        self.buffer.push(message);
        self.try_make_bundle(now);
        Ok(())
    }

    /// Cut a bundle if the buffer is large or old enough.
    pub fn try_make_bundle(&mut self, now: Instant) {
        if self.state != SessionState::SnapshotSaved || self.bundle_task.is_some() {
            return;
        }
        let config = &self.context.config;
        let full = self.buffer.len() > config.transfer_log_messages_count;
        let expired = self
            .window_start
            .map_or(false, |start| now > start + config.transfer_log_record_period);
        if full || expired {
            self.dispatch_bundle();
        }
    }

    /// Drive the record window and the final shipment.
    pub fn on_timer(&mut self, now: Instant, membership: Option<&GroupMembership>) {
        self.try_make_bundle(now);
        self.try_finish(membership);
    }

    pub fn on_membership_changed(&mut self, membership: &GroupMembership) {
        self.try_finish(Some(membership));
    }

    /// Handle the completion of one of this session's tasks.
    pub fn on_task_completed(
        &mut self,
        completion: TaskCompletion,
        now: Instant,
        membership: Option<&GroupMembership>,
        server_pending: usize,
    ) -> SessionEvent {
        let TaskCompletion { id, result } = completion;
        let is_snapshot = self
            .snapshot_task
            .as_ref()
            .map_or(false, |handle| handle.id() == id);
        if is_snapshot {
            self.snapshot_task = None;
        } else {
            self.bundle_task = None;
        }

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(client = %self.client.short(), error = %e, "state transfer failed");
                return self.fail();
            }
        };
        let file = match output {
            TaskOutput::SnapshotSaved { file: Some(file) } if is_snapshot => file,
            TaskOutput::MessagesSaved { file, .. } if !is_snapshot => file,
            other => {
                tracing::warn!(client = %self.client.short(), output = ?other, "unexpected session task output");
                other.discard();
                return self.fail();
            }
        };

        let last = self.buffer.is_empty()
            && server_pending == 0
            && membership.map_or(false, |view| view.contains(&self.client));

        if is_snapshot {
            self.state = SessionState::SnapshotSaved;
            self.respond(StateTransferResponse::snapshot(file, last));
            tracing::info!(client = %self.client.short(), last, "snapshot shipped");
            if last {
                self.state = SessionState::Closed;
                return SessionEvent::Closed;
            }
            self.try_make_bundle(now);
            return SessionEvent::SnapshotSaved;
        }

        self.bundles += 1;
        self.respond(StateTransferResponse::bundle(file, last));
        tracing::debug!(client = %self.client.short(), bundle = self.bundles, last, "bundle shipped");
        if last {
            self.state = SessionState::Closed;
            tracing::info!(client = %self.client.short(), bundles = self.bundles, "state transfer completed");
            return SessionEvent::Closed;
        }
        if !self.buffer.is_empty() {
            self.try_make_bundle(now);
        }
        SessionEvent::Progress
    }

    /// Abort the session; outstanding captures are canceled.
    pub fn cancel(&mut self) {
        for handle in [self.snapshot_task.take(), self.bundle_task.take()]
            .into_iter()
            .flatten()
        {
            handle.cancel();
        }
        self.buffer.clear();
        self.window_start = None;
        if !self.is_finished() {
            self.state = SessionState::Canceled;
        }
    }

    fn fail(&mut self) -> SessionEvent {
        self.respond(StateTransferResponse::failed());
        self.cancel();
        self.state = SessionState::Failed;
        SessionEvent::Failed
    }

    /// Ship whatever is buffered, even nothing, once the client has joined.
    fn try_finish(&mut self, membership: Option<&GroupMembership>) {
        if self.state != SessionState::SnapshotSaved
            || self.bundle_task.is_some()
            || !self.buffer.is_empty()
        {
            return;
        }
        if membership.map_or(false, |view| view.contains(&self.client)) {
            self.dispatch_bundle();
        }
    }

    fn dispatch_bundle(&mut self) {
        let messages = std::mem::take(&mut self.buffer);
        self.window_start = None;
        let file = self.context.temp_file("bundle");
        let task = MessagesSaveTask::new(self.context.codec.clone(), messages, file);
        self.bundle_task = Some(self.context.executor.execute(Box::new(task)));
    }

    fn respond(&self, response: StateTransferResponse) {
        self.context.sender.send(
            Message::to_node(
                self.context.local,
                self.client,
                MessagePart::StateTransferResponse(response),
            )
            .with_high_priority(),
        );
    }
}
