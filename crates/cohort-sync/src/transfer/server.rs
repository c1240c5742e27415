//! Serving side of state transfer.
//!
//! The server owns at most one capture at a time: a background snapshot for
//! the state store, a restore from the state store, or the snapshot of a
//! transfer session. While a capture is outstanding, state-changing group
//! messages are held back so the captured state and the shipped message log
//! line up exactly; they are replayed in arrival order once it completes.
//! Flush grants are also withheld while a message log bundle is being saved.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use cohort_core::{
    FailureDetector, Flush, FlowController, GroupMembership, LoopBound, Message, MessagePart,
    NodeId, StateTransferResponse,
};

use super::session::{SessionEvent, SessionFactory, StateTransferSession};
use super::TransferContext;
use crate::flush::FlushParticipant;
use crate::task::{
    SnapshotSaveTask, SnapshotTarget, StoreStateLoadTask, TaskCompletion, TaskHandle, TaskOutput,
};
use crate::transport::MessageReceiver;

/// Name under which the server records flush grants.
pub const STATE_TRANSFER_PARTICIPANT: &str = "state-transfer";

struct FlushState {
    flush: Flush,
    processing: bool,
    granted: bool,
    snapshot_deferred: bool,
}

/// State transfer server and flush participant.
pub struct StateTransferServerProtocol {
    context: Rc<TransferContext>,
    sessions: SessionFactory,
    receiver: Rc<dyn MessageReceiver>,
    flow: Rc<dyn FlowController>,
    membership: Option<GroupMembership>,
    session: Option<StateTransferSession>,
    background_task: Option<TaskHandle>,
    restore_task: Option<TaskHandle>,
    pending: VecDeque<Message>,
    pending_bytes: usize,
    flow_locked: Option<NodeId>,
    flush: Option<FlushState>,
    dirty: bool,
    last_background_save: Option<Instant>,
    _loop: LoopBound,
}

impl StateTransferServerProtocol {
    pub fn new(
        context: Rc<TransferContext>,
        receiver: Rc<dyn MessageReceiver>,
        flow: Rc<dyn FlowController>,
    ) -> Self {
        Self {
            sessions: SessionFactory::new(Rc::clone(&context)),
            context,
            receiver,
            flow,
            membership: None,
            session: None,
            background_task: None,
            restore_task: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            flow_locked: None,
            flush: None,
            dirty: false,
            last_background_save: None,
            _loop: LoopBound::new(),
        }
    }

    pub fn membership(&self) -> Option<&GroupMembership> {
        self.membership.as_ref()
    }

    pub fn session(&self) -> Option<&StateTransferSession> {
        self.session.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn is_flow_locked(&self) -> bool {
        self.flow_locked.is_some()
    }

    pub fn is_background_saving(&self) -> bool {
        self.background_task.is_some()
    }

    pub fn is_restoring(&self) -> bool {
        self.restore_task.is_some()
    }

    /// Whether a snapshot capture or restore is outstanding.
    pub fn is_capturing(&self) -> bool {
        self.background_task.is_some()
            || self.restore_task.is_some()
            || self
                .session
                .as_ref()
                .map_or(false, StateTransferSession::is_snapshot_pending)
    }

    /// Whether a capture or a message log save is outstanding.
    ///
    /// Flush grants are withheld while this holds.
    pub fn is_saving(&self) -> bool {
        self.is_capturing()
            || self
                .session
                .as_ref()
                .map_or(false, StateTransferSession::is_bundle_pending)
    }

    /// Install a view outside of a flush, e.g. the first view after joining.
    pub fn on_membership_changed(&mut self, membership: GroupMembership) {
        if let Some(session) = &mut self.session {
            session.on_membership_changed(&membership);
        }
        self.membership = Some(membership);
    }

    /// Handle a state transfer request or application traffic.
    pub fn receive(&mut self, message: Message, now: Instant) {
        if let MessagePart::StateTransferRequest = message.part {
            self.on_transfer_request(message.source);
            return;
        }

        let modifying = message.targets_group(&self.context.group)
            && self.context.server_app.is_modifying_message(&message.part);
        if modifying && self.is_capturing() {
            self.hold(message);
            return;
        }

        if modifying {
            self.dirty = true;
            if let Some(session) = &mut self.session {
                if session.accepts_messages() {
                    if let Err(e) = session.add_message(message.clone(), now) {
                        tracing::warn!(error = %e, "failed to record message for transfer");
                    }
                }
            }
            if self.is_saving() {
                self.revoke_flush_grant();
            }
        }
        self.receiver.receive(message);
    }

    /// Replay held back messages through [`receive`](Self::receive).
    ///
    /// Does nothing while a capture is still outstanding.
    pub fn deliver_pending_messages(&mut self, now: Instant) {
        if self.is_capturing() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        if let Some(source) = self.flow_locked.take() {
            self.flow.unlock_flow(&source);
            tracing::debug!(source = %source.short(), "flow unlocked");
        }
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "replaying held back messages");
        }
        for message in pending {
            self.receive(message, now);
        }
        self.try_grant_flush();
    }

    /// Periodic work: session record windows and background snapshots.
    pub fn on_timer(&mut self, now: Instant, failure_detector: &dyn FailureDetector) {
        if let Some(session) = &mut self.session {
            session.on_timer(now, self.membership.as_ref());
        }
        if self.is_saving() {
            self.revoke_flush_grant();
        }

        let idle = self.flush.is_none()
            && self.session.is_none()
            && self.background_task.is_none()
            && self.restore_task.is_none();
        let due = self.last_background_save.map_or(true, |at| {
            now.duration_since(at) > self.context.config.save_snapshot_period
        });
        let coordinator = failure_detector
            .current_coordinator()
            .map_or(false, |node| node.id == self.context.local);

        if idle && self.dirty && due && coordinator {
            let task = SnapshotSaveTask::new(
                Arc::clone(&self.context.server_app),
                self.context.temp_file("store"),
                SnapshotTarget::Store {
                    store: Arc::clone(&self.context.store),
                    group: self.context.group.clone(),
                },
            );
            self.background_task = Some(self.context.executor.execute(Box::new(task)));
            tracing::debug!(group = %self.context.group, "background snapshot started");
        }
    }

    /// Cancel the session if its client is gone.
    pub fn cleanup(&mut self, failure_detector: &dyn FailureDetector, now: Instant) {
        let Some(session) = &mut self.session else {
            return;
        };
        if failure_detector.is_unreachable(&session.client()) {
            tracing::info!(client = %session.client().short(), "client unreachable, canceling transfer");
            session.cancel();
            self.session = None;
            self.deliver_pending_messages(now);
        }
    }

    /// Route a task completion. Returns it back if it belongs to someone else.
    pub fn on_task_completed(
        &mut self,
        completion: TaskCompletion,
        now: Instant,
    ) -> Option<TaskCompletion> {
        let id = completion.id;

        if self.background_task.as_ref().map(TaskHandle::id) == Some(id) {
            self.background_task = None;
            match completion.result {
                Ok(_) => {
                    self.dirty = false;
                    self.last_background_save = Some(now);
                    tracing::info!(group = %self.context.group, "background snapshot stored");
                }
                Err(e) => tracing::warn!(group = %self.context.group, error = %e, "background snapshot failed"),
            }
            self.deliver_pending_messages(now);
            return None;
        }

        if self.restore_task.as_ref().map(TaskHandle::id) == Some(id) {
            self.restore_task = None;
            match completion.result {
                Ok(TaskOutput::StoreStateLoaded { found }) => {
                    tracing::info!(group = %self.context.group, found, "group state restored from store");
                }
                Ok(other) => other.discard(),
                Err(e) => tracing::warn!(group = %self.context.group, error = %e, "group state restore failed"),
            }
            self.deliver_pending_messages(now);
            return None;
        }

        let owned = self
            .session
            .as_ref()
            .map_or(false, |session| session.owns(id));
        if !owned {
            return Some(completion);
        }

        let pending = self.pending.len();
        let membership = self.membership.as_ref();
        let event = match &mut self.session {
            Some(session) => session.on_task_completed(completion, now, membership, pending),
            None => return None,
        };
        match event {
            SessionEvent::Progress => {
                if self.is_saving() {
                    self.revoke_flush_grant();
                } else {
                    self.try_grant_flush();
                }
            }
            SessionEvent::SnapshotSaved => self.deliver_pending_messages(now),
            SessionEvent::Closed | SessionEvent::Failed => {
                self.session = None;
                self.deliver_pending_messages(now);
            }
        }
        None
    }

    fn on_transfer_request(&mut self, client: NodeId) {
        if self.session.is_some() || self.background_task.is_some() || self.restore_task.is_some() {
            tracing::warn!(client = %client.short(), "rejecting concurrent state transfer request");
            self.context.sender.send(
                Message::to_node(
                    self.context.local,
                    client,
                    MessagePart::StateTransferResponse(StateTransferResponse::failed()),
                )
                .with_high_priority(),
            );
            return;
        }

        tracing::info!(client = %client.short(), "state transfer session created");
        self.session = Some(self.sessions.create(client));
        match &mut self.flush {
            Some(flush) if !flush.processing => {
                flush.snapshot_deferred = true;
                tracing::debug!(client = %client.short(), "snapshot deferred until flush processing");
            }
            _ => self.start_session_snapshot(),
        }
    }

    fn start_session_snapshot(&mut self) {
        if let Some(session) = &mut self.session {
            if let Err(e) = session.save_snapshot() {
                tracing::warn!(error = %e, "failed to start session snapshot");
                return;
            }
        }
        self.revoke_flush_grant();
    }

    fn hold(&mut self, message: Message) {
        self.pending_bytes += message.size();
        let source = message.source;
        self.pending.push_back(message);

        if self.pending_bytes >= self.context.config.min_lock_queue_capacity
            && self.flow_locked.is_none()
        {
            self.flow.lock_flow(&source);
            self.flow_locked = Some(source);
            tracing::warn!(
                source = %source.short(),
                bytes = self.pending_bytes,
                "held back messages reached watermark, flow locked"
            );
        }
        self.revoke_flush_grant();
    }

    fn try_grant_flush(&mut self) {
        let saving = self.is_saving();
        if let Some(state) = &mut self.flush {
            if !state.granted && !state.snapshot_deferred && !saving {
                state.flush.grant(STATE_TRANSFER_PARTICIPANT);
                state.granted = true;
            }
        }
    }

    fn revoke_flush_grant(&mut self) {
        if let Some(state) = &mut self.flush {
            if state.granted {
                state.flush.revoke(STATE_TRANSFER_PARTICIPANT);
                state.granted = false;
            }
        }
    }
}

impl FlushParticipant for StateTransferServerProtocol {
    fn participant_name(&self) -> &'static str {
        STATE_TRANSFER_PARTICIPANT
    }

    fn is_flush_processing_required(&self) -> bool {
        true
    }

    fn start_flush(&mut self, flush: Flush) {
        let coordinator = flush
            .new_membership()
            .members()
            .first()
            .map_or(false, |node| node.id == self.context.local);
        let restore = flush.is_group_forming() && coordinator && self.restore_task.is_none();

        self.flush = Some(FlushState {
            flush,
            processing: false,
            granted: false,
            snapshot_deferred: false,
        });

        if restore {
            let task = StoreStateLoadTask::new(
                Arc::clone(&self.context.store),
                self.context.group.clone(),
                Arc::clone(&self.context.client_app),
                self.context.temp_file("restore"),
            );
            self.restore_task = Some(self.context.executor.execute(Box::new(task)));
            tracing::info!(group = %self.context.group, "restoring group state from store");
        }

        if self.is_saving() {
            tracing::debug!("flush grant deferred until outstanding saves complete");
        }
        self.try_grant_flush();
    }

    fn process_flush(&mut self) {
        let deferred = match &mut self.flush {
            Some(state) => {
                state.processing = true;
                std::mem::take(&mut state.snapshot_deferred)
            }
            None => false,
        };
        if deferred {
            self.start_session_snapshot();
        }
        self.try_grant_flush();
    }

    fn end_flush(&mut self) {
        let Some(state) = self.flush.take() else {
            return;
        };
        if state.snapshot_deferred {
            self.start_session_snapshot();
        }
        self.on_membership_changed(state.flush.new_membership().clone());
    }
}
