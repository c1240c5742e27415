//! State transfer: shipping the group state to a joining node.
//!
//! A member serving a transfer captures a snapshot while holding back
//! state-changing traffic, ships it, and then ships every state-changing
//! message it applied afterwards as message log bundles until the joining
//! node is a member and nothing is left to ship.

pub mod client;
pub mod server;
pub mod session;

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use cohort_core::{GroupId, NodeId};
use cohort_store::{MessageLogCodec, StateStore};

use crate::app::{StateTransferClient, StateTransferServer};
use crate::config::StateTransferConfig;
use crate::error::Result;
use crate::task::TaskExecutor;
use crate::transport::MessageSender;

pub use client::{ClientState, StateTransferClientProtocol};
pub use server::{StateTransferServerProtocol, STATE_TRANSFER_PARTICIPANT};
pub use session::{SessionEvent, SessionFactory, SessionState, StateTransferSession};

/// External services a transfer needs.
pub struct Collaborators {
    pub server_app: Arc<dyn StateTransferServer>,
    pub client_app: Arc<dyn StateTransferClient>,
    pub store: Arc<dyn StateStore>,
    pub executor: Rc<dyn TaskExecutor>,
    pub sender: Rc<dyn MessageSender>,
}

/// Everything shared by the server, its sessions and the client on one node.
pub struct TransferContext {
    pub local: NodeId,
    pub group: GroupId,
    pub config: StateTransferConfig,
    pub codec: MessageLogCodec,
    pub server_app: Arc<dyn StateTransferServer>,
    pub client_app: Arc<dyn StateTransferClient>,
    pub store: Arc<dyn StateStore>,
    pub executor: Rc<dyn TaskExecutor>,
    pub sender: Rc<dyn MessageSender>,
    temp_seq: Cell<u64>,
}

impl TransferContext {
    /// Build the context, creating the work directory if needed.
    pub fn new(
        local: NodeId,
        group: GroupId,
        config: StateTransferConfig,
        codec: MessageLogCodec,
        collaborators: Collaborators,
    ) -> Result<Rc<Self>> {
        std::fs::create_dir_all(&config.work_dir)?;
        let Collaborators {
            server_app,
            client_app,
            store,
            executor,
            sender,
        } = collaborators;
        Ok(Rc::new(Self {
            local,
            group,
            config,
            codec,
            server_app,
            client_app,
            store,
            executor,
            sender,
            temp_seq: Cell::new(0),
        }))
    }

    /// A fresh temp file path in the work directory.
    pub fn temp_file(&self, kind: &str) -> PathBuf {
        let seq = self.temp_seq.get() + 1;
        self.temp_seq.set(seq);
        self.config
            .work_dir
            .join(format!("{}-{}-{:06}.tmp", self.local.short(), kind, seq))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::cell::RefCell;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;

    use cohort_core::{
        ApplicationPart, FailureDetector, FlowController, GroupMembership, Message, MessagePart,
        Node, StateTransferResponse,
    };
    use cohort_store::{CborSerializer, MemoryStateStore};
    use tempfile::TempDir;

    use crate::task::ManualTaskExecutor;
    use crate::transport::memory::RecordingSender;

    pub const GROUP: &str = "orders";

    /// Key-value application state; `put` messages modify it, `get` does not.
    #[derive(Default)]
    pub struct TestApp {
        pub state: Mutex<Vec<u8>>,
        pub fail_saves: Mutex<bool>,
    }

    impl StateTransferServer for TestApp {
        fn save_snapshot(&self, file: &Path) -> io::Result<()> {
            if *self.fail_saves.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            std::fs::write(file, &*self.state.lock().unwrap())
        }

        fn is_modifying_message(&self, part: &MessagePart) -> bool {
            matches!(part, MessagePart::Application(app) if app.kind == "put")
        }
    }

    impl StateTransferClient for TestApp {
        fn load_snapshot(&self, file: &Path) -> io::Result<()> {
            *self.state.lock().unwrap() = std::fs::read(file)?;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingFlow {
        pub calls: RefCell<Vec<(&'static str, NodeId)>>,
    }

    impl FlowController for RecordingFlow {
        fn lock_flow(&self, source: &NodeId) {
            self.calls.borrow_mut().push(("lock", *source));
        }

        fn unlock_flow(&self, source: &NodeId) {
            self.calls.borrow_mut().push(("unlock", *source));
        }
    }

    #[derive(Default)]
    pub struct Detector {
        pub coordinator: Option<Node>,
        pub healthy: Vec<Node>,
        pub failed: Vec<Node>,
        pub left: Vec<Node>,
    }

    impl FailureDetector for Detector {
        fn current_coordinator(&self) -> Option<Node> {
            self.coordinator.clone()
        }

        fn healthy_members(&self) -> Vec<Node> {
            self.healthy.clone()
        }

        fn failed_members(&self) -> Vec<Node> {
            self.failed.clone()
        }

        fn left_members(&self) -> Vec<Node> {
            self.left.clone()
        }
    }

    pub fn id(n: u128) -> NodeId {
        NodeId::from_u128(n)
    }

    pub fn node(n: u128) -> Node {
        Node::new(id(n), format!("127.0.0.1:{}", 6000 + n).parse().unwrap(), "core")
    }

    pub fn view(version: u64, members: &[u128]) -> GroupMembership {
        GroupMembership::new(version, members.iter().map(|n| node(*n)).collect()).unwrap()
    }

    pub fn put(source: u128, value: u8) -> Message {
        Message::to_group(
            id(source),
            GroupId::new(GROUP),
            MessagePart::Application(ApplicationPart::new("put", vec![value])),
        )
    }

    pub fn get(source: u128) -> Message {
        Message::to_group(
            id(source),
            GroupId::new(GROUP),
            MessagePart::Application(ApplicationPart::new("get", Vec::new())),
        )
    }

    pub fn request(source: u128, target: u128) -> Message {
        Message::to_node(id(source), id(target), MessagePart::StateTransferRequest)
    }

    /// Responses sent to `client`, in order.
    pub fn responses(sender: &RecordingSender, client: NodeId) -> Vec<StateTransferResponse> {
        sender
            .take()
            .into_iter()
            .filter(|message| message.destination == cohort_core::Destination::Node(client))
            .filter_map(|message| match message.part {
                MessagePart::StateTransferResponse(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    pub struct Harness {
        pub dir: TempDir,
        pub app: Arc<TestApp>,
        pub store: MemoryStateStore,
        pub executor: Rc<ManualTaskExecutor>,
        pub sender: Rc<RecordingSender>,
        pub context: Rc<TransferContext>,
    }

    impl Harness {
        pub fn new(local: u128) -> Self {
            Self::with_config(local, |config| config)
        }

        pub fn with_config(
            local: u128,
            configure: impl FnOnce(StateTransferConfig) -> StateTransferConfig,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let app = Arc::new(TestApp::default());
            let store = MemoryStateStore::new();
            let executor = Rc::new(ManualTaskExecutor::new());
            let sender = Rc::new(RecordingSender::new());
            let config = configure(StateTransferConfig::default().with_work_dir(dir.path()));
            let context = TransferContext::new(
                id(local),
                GroupId::new(GROUP),
                config,
                MessageLogCodec::new(Arc::new(CborSerializer)),
                Collaborators {
                    server_app: app.clone(),
                    client_app: app.clone(),
                    store: Arc::new(store.clone()),
                    executor: executor.clone(),
                    sender: sender.clone(),
                },
            )
            .unwrap();
            Self {
                dir,
                app,
                store,
                executor,
                sender,
                context,
            }
        }
    }
}
