//! Test fixtures and helpers.
//!
//! Common setup code for protocol and integration tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use cohort_core::{
    ApplicationPart, FailureDetector, FlowController, GroupId, GroupMembership, Message,
    MessagePart, Node, NodeId,
};
use cohort_sync::{MessageReceiver, StateTransferClient, StateTransferServer};

/// Deterministic node id.
pub fn node_id(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

/// Deterministic node on a loopback address.
pub fn node(n: u128) -> Node {
    let port = 20_000 + (n % 40_000) as u16;
    Node::new(
        node_id(n),
        std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        "test",
    )
}

/// View `version` containing the given nodes in order.
///
/// # Panics
///
/// Panics on duplicate members.
pub fn membership(version: u64, members: &[u128]) -> GroupMembership {
    GroupMembership::new(version, members.iter().map(|n| node(*n)).collect())
        .expect("duplicate member in test view")
}

/// A `put key=value` group message.
pub fn put(source: u128, group: &GroupId, key: &str, value: &str) -> Message {
    Message::to_group(node_id(source), group.clone(), KvApp::put_part(key, value))
}

/// A replicated key-value map.
///
/// `put` application messages with a `key=value` payload modify it; every
/// other message is ignored. Snapshots are `key=value` lines.
#[derive(Clone, Default)]
pub struct KvApp {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl KvApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_part(key: &str, value: &str) -> MessagePart {
        MessagePart::Application(ApplicationPart::new("put", format!("{key}={value}")))
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.lock().insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A poisoned map only happens after a test already panicked.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, part: &ApplicationPart) {
        if part.kind != "put" {
            return;
        }
        let Ok(text) = std::str::from_utf8(&part.payload) else {
            return;
        };
        if let Some((key, value)) = text.split_once('=') {
            self.insert(key, value);
        }
    }
}

impl StateTransferServer for KvApp {
    fn save_snapshot(&self, file: &Path) -> io::Result<()> {
        let image: String = self
            .lock()
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect();
        std::fs::write(file, image)
    }

    fn is_modifying_message(&self, part: &MessagePart) -> bool {
        matches!(part, MessagePart::Application(app) if app.kind == "put")
    }
}

impl StateTransferClient for KvApp {
    fn load_snapshot(&self, file: &Path) -> io::Result<()> {
        let image = std::fs::read_to_string(file)?;
        let entries = image
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        *self.lock() = entries;
        Ok(())
    }
}

impl MessageReceiver for KvApp {
    fn receive(&self, message: Message) {
        if let MessagePart::Application(part) = &message.part {
            self.apply(part);
        }
    }
}

/// Failure detector whose answers are set by the test.
#[derive(Default)]
pub struct StaticFailureDetector {
    coordinator: RefCell<Option<Node>>,
    healthy: RefCell<Vec<Node>>,
    failed: RefCell<Vec<Node>>,
    left: RefCell<Vec<Node>>,
}

impl StaticFailureDetector {
    /// All of `members` healthy; the first one is coordinator.
    pub fn new(members: &[Node]) -> Self {
        let detector = Self::default();
        detector.set_healthy(members);
        detector
    }

    pub fn set_healthy(&self, members: &[Node]) {
        *self.coordinator.borrow_mut() = members.first().cloned();
        *self.healthy.borrow_mut() = members.to_vec();
    }

    pub fn set_coordinator(&self, coordinator: Option<Node>) {
        *self.coordinator.borrow_mut() = coordinator;
    }

    pub fn mark_failed(&self, node: &Node) {
        self.healthy.borrow_mut().retain(|member| member.id != node.id);
        self.failed.borrow_mut().push(node.clone());
    }

    pub fn mark_left(&self, node: &Node) {
        self.healthy.borrow_mut().retain(|member| member.id != node.id);
        self.left.borrow_mut().push(node.clone());
    }
}

impl FailureDetector for StaticFailureDetector {
    fn current_coordinator(&self) -> Option<Node> {
        self.coordinator.borrow().clone()
    }

    fn healthy_members(&self) -> Vec<Node> {
        self.healthy.borrow().clone()
    }

    fn failed_members(&self) -> Vec<Node> {
        self.failed.borrow().clone()
    }

    fn left_members(&self) -> Vec<Node> {
        self.left.borrow().clone()
    }
}

/// Flow controller that records lock and unlock calls.
#[derive(Default)]
pub struct RecordingFlowController {
    calls: RefCell<Vec<FlowCall>>,
}

/// A recorded flow control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCall {
    Lock(NodeId),
    Unlock(NodeId),
}

impl RecordingFlowController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<FlowCall> {
        self.calls.borrow().clone()
    }
}

impl FlowController for RecordingFlowController {
    fn lock_flow(&self, source: &NodeId) {
        self.calls.borrow_mut().push(FlowCall::Lock(*source));
    }

    fn unlock_flow(&self, source: &NodeId) {
        self.calls.borrow_mut().push(FlowCall::Unlock(*source));
    }
}
