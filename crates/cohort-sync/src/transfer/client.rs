//! Receiving side of state transfer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use cohort_core::{LoopBound, Message, MessagePart, NodeId, StateTransferResponse};

use super::TransferContext;
use crate::error::{Result, SyncError};
use crate::task::{
    remove_temp, MessageSink, MessagesLoadTask, SnapshotLoadTask, TaskCompletion, TaskHandle,
    TaskOutput,
};
use crate::transport::MessageReceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    /// Request sent, nothing received yet.
    Requested,
    /// Snapshot or bundles are being applied.
    Loading,
    Completed,
    Failed,
}

/// Requests the group state from a member and applies what it ships.
///
/// The snapshot is applied first, then bundles in arrival order, one replay
/// task at a time. Live group traffic seen before the final shipment is
/// already covered by the bundles and is dropped; traffic seen after it is
/// held and delivered once everything is applied.
pub struct StateTransferClientProtocol {
    context: Rc<TransferContext>,
    sink: Arc<dyn MessageSink>,
    receiver: Rc<dyn MessageReceiver>,
    state: ClientState,
    server: Option<NodeId>,
    snapshot_task: Option<TaskHandle>,
    replay_task: Option<TaskHandle>,
    snapshot_loaded: bool,
    last_received: bool,
    queued: VecDeque<PathBuf>,
    held: Vec<Message>,
    _loop: LoopBound,
}

impl StateTransferClientProtocol {
    pub fn new(
        context: Rc<TransferContext>,
        sink: Arc<dyn MessageSink>,
        receiver: Rc<dyn MessageReceiver>,
    ) -> Self {
        Self {
            context,
            sink,
            receiver,
            state: ClientState::Idle,
            server: None,
            snapshot_task: None,
            replay_task: None,
            snapshot_loaded: false,
            last_received: false,
            queued: VecDeque::new(),
            held: Vec::new(),
            _loop: LoopBound::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn server(&self) -> Option<NodeId> {
        self.server
    }

    pub fn is_transferring(&self) -> bool {
        matches!(self.state, ClientState::Requested | ClientState::Loading)
    }

    /// Ask `server` for the group state.
    pub fn request_state(&mut self, server: NodeId) -> Result<()> {
        if self.is_transferring() {
            return Err(SyncError::InvalidState(format!(
                "state transfer from {} already in progress",
                self.server.map(|node| node.to_string()).unwrap_or_default()
            )));
        }
        self.reset();
        self.server = Some(server);
        self.state = ClientState::Requested;
        self.context.sender.send(
            Message::to_node(self.context.local, server, MessagePart::StateTransferRequest)
                .with_high_priority(),
        );
        tracing::info!(server = %server.short(), "state transfer requested");
        Ok(())
    }

    /// Handle a shipment from the server.
    pub fn on_response(&mut self, source: NodeId, response: StateTransferResponse) {
        if !self.is_transferring() || self.server != Some(source) {
            tracing::debug!(source = %source.short(), "ignoring unexpected state transfer response");
            if let Some(file) = &response.file {
                remove_temp(file);
            }
            return;
        }

        if response.failed {
            tracing::warn!(server = %source.short(), "server failed the state transfer");
            self.fail();
            return;
        }
        let Some(file) = response.file else {
            tracing::warn!(server = %source.short(), "state transfer response without file");
            self.fail();
            return;
        };

        self.state = ClientState::Loading;
        if response.last {
            self.last_received = true;
        }

        if response.snapshot {
            if self.snapshot_loaded || self.snapshot_task.is_some() {
                tracing::warn!(server = %source.short(), "duplicate snapshot ignored");
                remove_temp(&file);
                return;
            }
            let task = SnapshotLoadTask::new(Arc::clone(&self.context.client_app), file);
            self.snapshot_task = Some(self.context.executor.execute(Box::new(task)));
        } else {
            self.queued.push_back(file);
            self.try_replay();
        }
        self.check_completed();
    }

    /// Filter live traffic during a transfer.
    ///
    /// Returns the message back when it should take the normal path.
    pub fn filter_live(&mut self, message: Message) -> Option<Message> {
        if !self.is_transferring() || !message.targets_group(&self.context.group) {
            return Some(message);
        }
        if self.last_received {
            self.held.push(message);
        }
        None
    }

    /// Route a task completion. Returns it back if it belongs to someone else.
    pub fn on_task_completed(&mut self, completion: TaskCompletion) -> Option<TaskCompletion> {
        let id = completion.id;
        if self.snapshot_task.as_ref().map(TaskHandle::id) == Some(id) {
            self.snapshot_task = None;
            match completion.result {
                Ok(_) => {
                    self.snapshot_loaded = true;
                    tracing::info!("snapshot applied");
                    self.try_replay();
                    self.check_completed();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to apply snapshot");
                    self.fail();
                }
            }
            return None;
        }

        if self.replay_task.as_ref().map(TaskHandle::id) == Some(id) {
            self.replay_task = None;
            match completion.result {
                Ok(TaskOutput::MessagesLoaded { files, messages }) => {
                    tracing::debug!(files, messages, "message logs replayed");
                    self.try_replay();
                    self.check_completed();
                }
                Ok(other) => {
                    other.discard();
                    self.try_replay();
                    self.check_completed();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to replay message log");
                    self.fail();
                }
            }
            return None;
        }

        Some(completion)
    }

    /// Abandon the transfer and return to idle.
    pub fn cancel(&mut self) {
        self.abort();
        self.state = ClientState::Idle;
    }

    fn try_replay(&mut self) {
        if !self.snapshot_loaded || self.replay_task.is_some() || self.queued.is_empty() {
            return;
        }
        let files: Vec<PathBuf> = self.queued.drain(..).collect();
        let task = MessagesLoadTask::new(self.context.codec.clone(), files, Arc::clone(&self.sink));
        self.replay_task = Some(self.context.executor.execute(Box::new(task)));
    }

    fn check_completed(&mut self) {
        let done = self.state == ClientState::Loading
            && self.last_received
            && self.snapshot_loaded
            && self.snapshot_task.is_none()
            && self.replay_task.is_none()
            && self.queued.is_empty();
        if !done {
            return;
        }
        self.state = ClientState::Completed;
        let held = std::mem::take(&mut self.held);
        tracing::info!(held = held.len(), "state transfer completed");
        for message in held {
            self.receiver.receive(message);
        }
    }

    fn fail(&mut self) {
        self.abort();
        self.state = ClientState::Failed;
    }

    fn abort(&mut self) {
        for handle in [self.snapshot_task.take(), self.replay_task.take()]
            .into_iter()
            .flatten()
        {
            handle.cancel();
        }
        for file in self.queued.drain(..) {
            remove_temp(&file);
        }
        self.held.clear();
    }

    fn reset(&mut self) {
        self.abort();
        self.snapshot_loaded = false;
        self.last_received = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::fixtures::*;
    use crate::transport::memory::RecordingReceiver;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Applied(Mutex<Vec<Message>>);

    #[async_trait]
    impl MessageSink for Applied {
        async fn deliver(&self, messages: Vec<Message>) -> Result<()> {
            self.0.lock().unwrap().extend(messages);
            Ok(())
        }
    }

    struct Client {
        harness: Harness,
        applied: Arc<Applied>,
        receiver: Rc<RecordingReceiver>,
        protocol: StateTransferClientProtocol,
    }

    fn client() -> Client {
        let harness = Harness::new(3);
        let applied = Arc::new(Applied::default());
        let receiver = Rc::new(RecordingReceiver::new());
        let protocol =
            StateTransferClientProtocol::new(harness.context.clone(), applied.clone(), receiver.clone());
        Client {
            harness,
            applied,
            receiver,
            protocol,
        }
    }

    fn snapshot_file(c: &Client, state: &[u8]) -> PathBuf {
        let file = c.harness.context.temp_file("incoming-snapshot");
        std::fs::write(&file, state).unwrap();
        file
    }

    fn bundle_file(c: &Client, messages: &[Message]) -> PathBuf {
        let file = c.harness.context.temp_file("incoming-bundle");
        c.harness.context.codec.save(messages, &file).unwrap();
        file
    }

    /// Run tasks until none are left, including follow-up tasks.
    async fn run_all(c: &mut Client) {
        while c.harness.executor.pending() > 0 {
            if let Some(completion) = c.harness.executor.run_next().await {
                assert!(c.protocol.on_task_completed(completion).is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_snapshot_then_bundles_complete_in_order() {
        let mut c = client();
        c.protocol.request_state(id(1)).unwrap();
        let sent = c.harness.sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].part, MessagePart::StateTransferRequest);
        assert_eq!(c.protocol.state(), ClientState::Requested);

        let snapshot = snapshot_file(&c, b"base");
        c.protocol
            .on_response(id(1), StateTransferResponse::snapshot(snapshot.clone(), false));
        let first = bundle_file(&c, &[put(2, 1), put(2, 2)]);
        c.protocol
            .on_response(id(1), StateTransferResponse::bundle(first, false));
        assert_eq!(c.harness.executor.pending_names(), vec!["snapshot-load"]);

        run_all(&mut c).await;
        assert_eq!(*c.harness.app.state.lock().unwrap(), b"base");
        assert_eq!(c.protocol.state(), ClientState::Loading);

        let last = bundle_file(&c, &[put(2, 3)]);
        c.protocol
            .on_response(id(1), StateTransferResponse::bundle(last, true));
        run_all(&mut c).await;

        assert_eq!(c.protocol.state(), ClientState::Completed);
        assert_eq!(*c.applied.0.lock().unwrap(), vec![put(2, 1), put(2, 2), put(2, 3)]);
        assert!(!snapshot.exists());
        assert_eq!(std::fs::read_dir(c.harness.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_last_snapshot_completes_without_bundles() {
        let mut c = client();
        c.protocol.request_state(id(1)).unwrap();
        let snapshot = snapshot_file(&c, b"only");
        c.protocol
            .on_response(id(1), StateTransferResponse::snapshot(snapshot, true));
        run_all(&mut c).await;
        assert_eq!(c.protocol.state(), ClientState::Completed);
    }

    #[tokio::test]
    async fn test_failed_response_cancels_loads() {
        let mut c = client();
        c.protocol.request_state(id(1)).unwrap();
        let snapshot = snapshot_file(&c, b"base");
        c.protocol
            .on_response(id(1), StateTransferResponse::snapshot(snapshot, false));
        let bundle = bundle_file(&c, &[put(2, 1)]);
        c.protocol
            .on_response(id(1), StateTransferResponse::bundle(bundle.clone(), false));

        c.protocol.on_response(id(1), StateTransferResponse::failed());
        assert_eq!(c.protocol.state(), ClientState::Failed);
        assert!(!bundle.exists());
        assert!(c.harness.executor.run_next().await.is_none());
    }

    #[tokio::test]
    async fn test_live_traffic_dropped_then_held() {
        let mut c = client();
        c.protocol.request_state(id(1)).unwrap();

        assert!(c.protocol.filter_live(put(2, 1)).is_none());
        let direct = request(2, 3);
        assert_eq!(c.protocol.filter_live(direct.clone()), Some(direct));

        let snapshot = snapshot_file(&c, b"base");
        c.protocol
            .on_response(id(1), StateTransferResponse::snapshot(snapshot, true));
        assert!(c.protocol.filter_live(put(2, 9)).is_none());
        assert!(c.receiver.received().is_empty());

        run_all(&mut c).await;
        assert_eq!(c.receiver.take(), vec![put(2, 9)]);
        assert_eq!(c.protocol.filter_live(put(2, 10)), Some(put(2, 10)));
    }

    #[tokio::test]
    async fn test_responses_from_other_nodes_are_ignored() {
        let mut c = client();
        c.protocol.request_state(id(1)).unwrap();
        let stray = snapshot_file(&c, b"stray");
        c.protocol
            .on_response(id(2), StateTransferResponse::snapshot(stray.clone(), true));
        assert!(!stray.exists());
        assert_eq!(c.protocol.state(), ClientState::Requested);
        assert_eq!(c.harness.executor.pending(), 0);
    }

    #[test]
    fn test_request_while_transferring_is_rejected() {
        let mut c = client();
        c.protocol.request_state(id(1)).unwrap();
        assert!(matches!(
            c.protocol.request_state(id(2)),
            Err(SyncError::InvalidState(_))
        ));
        c.protocol.cancel();
        assert_eq!(c.protocol.state(), ClientState::Idle);
        c.protocol.request_state(id(2)).unwrap();
        assert_eq!(c.protocol.server(), Some(id(2)));
    }
}
