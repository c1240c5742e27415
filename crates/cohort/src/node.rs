//! The node event loop.
//!
//! A [`GroupNode`] owns the state transfer server and client and the data
//! exchange protocol, and drives them from a single task. It must run on a
//! [`tokio::task::LocalSet`]; protocol state never leaves that task.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use cohort_core::{
    FailureDetector, Flush, FlowController, GroupMembership, Message, MessagePart, NodeId,
};
use cohort_store::{CborSerializer, MessageLogCodec, StateStore};
use cohort_sync::{
    ClientState, Collaborators, DataExchangeProtocol, DataExchangeProvider, FlushParticipant,
    MessageReceiver, MessageSender, ReplayBatch, ReplaySink, StateTransferClient,
    StateTransferClientProtocol, StateTransferServer, StateTransferServerProtocol,
    TaskCompletion, TokioTaskExecutor, TransferContext,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// Services a node is wired to.
pub struct NodeServices {
    pub server_app: Arc<dyn StateTransferServer>,
    pub client_app: Arc<dyn StateTransferClient>,
    pub store: Arc<dyn StateStore>,
    pub sender: Rc<dyn MessageSender>,
    pub receiver: Rc<dyn MessageReceiver>,
    pub failure_detector: Rc<dyn FailureDetector>,
    pub flow: Rc<dyn FlowController>,
}

/// Control events posted to a running node.
#[derive(Debug)]
pub enum NodeEvent {
    /// Install a view outside of a flush.
    Membership(GroupMembership),
    StartFlush(Flush),
    ProcessFlush,
    EndFlush,
    /// Fetch the group state from a member.
    RequestState(NodeId),
    Status(oneshot::Sender<NodeStatus>),
    Shutdown,
}

/// Snapshot of a node's protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub client: ClientState,
    pub serving: Option<NodeId>,
    pub held_back: usize,
    pub ring_next: Option<NodeId>,
}

/// Posts events to a running [`GroupNode`].
#[derive(Clone)]
pub struct NodeHandle {
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeHandle {
    pub fn install_membership(&self, membership: GroupMembership) -> Result<()> {
        self.post(NodeEvent::Membership(membership))
    }

    pub fn start_flush(&self, flush: Flush) -> Result<()> {
        self.post(NodeEvent::StartFlush(flush))
    }

    pub fn process_flush(&self) -> Result<()> {
        self.post(NodeEvent::ProcessFlush)
    }

    pub fn end_flush(&self) -> Result<()> {
        self.post(NodeEvent::EndFlush)
    }

    pub fn request_state(&self, server: NodeId) -> Result<()> {
        self.post(NodeEvent::RequestState(server))
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.post(NodeEvent::Status(tx))?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.post(NodeEvent::Shutdown)
    }

    fn post(&self, event: NodeEvent) -> Result<()> {
        self.events.send(event).map_err(|_| NodeError::Stopped)
    }
}

struct Protocols {
    server: StateTransferServerProtocol,
    client: StateTransferClientProtocol,
    exchange: DataExchangeProtocol,
    receiver: Rc<dyn MessageReceiver>,
    failure_detector: Rc<dyn FailureDetector>,
}

/// A cluster node serving one replicated group.
pub struct GroupNode {
    local: NodeId,
    protocols: Protocols,
    config: NodeConfig,
    inbox: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    completions: mpsc::UnboundedReceiver<TaskCompletion>,
    replays: mpsc::UnboundedReceiver<ReplayBatch>,
}

impl GroupNode {
    /// Wire a node. `inbox` carries every message addressed to it.
    pub fn new(
        config: NodeConfig,
        services: NodeServices,
        inbox: mpsc::UnboundedReceiver<Message>,
    ) -> Result<(Self, NodeHandle)> {
        let (executor, completions) = TokioTaskExecutor::new();
        let (sink, replays) = ReplaySink::new();
        let (events_tx, events) = mpsc::unbounded_channel();

        let context = TransferContext::new(
            config.node_id,
            config.group.clone(),
            config.state_transfer.clone(),
            MessageLogCodec::new(Arc::new(CborSerializer)),
            Collaborators {
                server_app: services.server_app,
                client_app: services.client_app,
                store: services.store,
                executor: Rc::new(executor),
                sender: Rc::clone(&services.sender),
            },
        )?;

        let protocols = Protocols {
            server: StateTransferServerProtocol::new(
                Rc::clone(&context),
                Rc::clone(&services.receiver),
                services.flow,
            ),
            client: StateTransferClientProtocol::new(
                context,
                Arc::new(sink),
                Rc::clone(&services.receiver),
            ),
            exchange: DataExchangeProtocol::new(
                config.node_id,
                config.data_exchange.clone(),
                services.sender,
            ),
            receiver: services.receiver,
            failure_detector: services.failure_detector,
        };

        Ok((
            Self {
                local: config.node_id,
                protocols,
                config,
                inbox,
                events,
                completions,
                replays,
            },
            NodeHandle { events: events_tx },
        ))
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local
    }

    /// Add a data exchange provider. Takes effect from the next view.
    pub fn register_provider(&mut self, provider: Box<dyn DataExchangeProvider>) {
        self.protocols.exchange.register(provider);
    }

    /// Run until shut down or until the inbox closes.
    pub async fn run(self) -> Result<()> {
        let GroupNode {
            local,
            mut protocols,
            config,
            mut inbox,
            mut events,
            mut completions,
            mut replays,
        } = self;

        let mut ticker = tokio::time::interval(config.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(node = %local.short(), group = %config.group, "node started");

        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => protocols.on_message(message, Instant::now()),
                    None => {
                        tracing::info!(node = %local.short(), "inbox closed");
                        break;
                    }
                },
                Some(event) = events.recv() => {
                    if !protocols.on_event(event, Instant::now()) {
                        break;
                    }
                }
                Some(completion) = completions.recv() => {
                    protocols.on_completion(completion, Instant::now());
                }
                Some(batch) = replays.recv() => protocols.on_replay(batch),
                _ = ticker.tick() => protocols.on_tick(Instant::now()),
            }
        }

        tracing::info!(node = %local.short(), "node stopped");
        Ok(())
    }
}

impl Protocols {
    fn on_message(&mut self, message: Message, now: Instant) {
        let Message {
            source,
            destination,
            part,
            high_priority,
        } = message;
        match part {
            MessagePart::StateTransferResponse(response) => {
                self.client.on_response(source, response)
            }
            MessagePart::DataExchange(exchange) => self.exchange.receive(source, exchange),
            part @ (MessagePart::StateTransferRequest | MessagePart::Application(_)) => {
                let message = Message {
                    source,
                    destination,
                    part,
                    high_priority,
                };
                if let Some(message) = self.client.filter_live(message) {
                    self.server.receive(message, now);
                }
            }
        }
    }

    /// Returns false when the loop should stop.
    fn on_event(&mut self, event: NodeEvent, now: Instant) -> bool {
        match event {
            NodeEvent::Membership(membership) => {
                self.exchange.on_membership_changed(
                    &membership,
                    self.failure_detector.as_ref(),
                    now,
                );
                self.server.on_membership_changed(membership);
            }
            NodeEvent::StartFlush(flush) => self.server.start_flush(flush),
            NodeEvent::ProcessFlush => self.server.process_flush(),
            NodeEvent::EndFlush => {
                self.server.end_flush();
                if let Some(membership) = self.server.membership() {
                    self.exchange.on_membership_changed(
                        membership,
                        self.failure_detector.as_ref(),
                        now,
                    );
                }
            }
            NodeEvent::RequestState(server) => {
                if let Err(e) = self.client.request_state(server) {
                    tracing::warn!(error = %e, "state request rejected");
                }
            }
            NodeEvent::Status(reply) => {
                let status = NodeStatus {
                    client: self.client.state(),
                    serving: self.server.session().map(|session| session.client()),
                    held_back: self.server.pending_len(),
                    ring_next: self.exchange.next_node(),
                };
                // The asker may have given up.
                let _ = reply.send(status);
            }
            NodeEvent::Shutdown => {
                self.client.cancel();
                return false;
            }
        }
        true
    }

    fn on_completion(&mut self, completion: TaskCompletion, now: Instant) {
        let Some(completion) = self.server.on_task_completed(completion, now) else {
            return;
        };
        let Some(completion) = self.client.on_task_completed(completion) else {
            return;
        };
        tracing::debug!(id = %completion.id, "completion for unknown task");
        if let Ok(output) = completion.result {
            output.discard();
        }
    }

    fn on_replay(&mut self, batch: ReplayBatch) {
        let ReplayBatch { messages, ack } = batch;
        for message in messages {
            self.receiver.receive(message);
        }
        // A dropped ack means the load task was canceled.
        let _ = ack.send(());
    }

    fn on_tick(&mut self, now: Instant) {
        self.exchange.on_timer(now);
        self.server.on_timer(now, self.failure_detector.as_ref());
        self.server.cleanup(self.failure_detector.as_ref(), now);
    }
}
