//! Transport abstraction for the group protocols.
//!
//! Protocols hand outbound messages to a [`MessageSender`] and deliver
//! application traffic to a [`MessageReceiver`]. Both are called on the event
//! loop thread; sending never blocks and never fails synchronously, delivery
//! failures surface through the failure detector.

use cohort_core::Message;

/// Outbound half of the node transport.
pub trait MessageSender {
    fn send(&self, message: Message);
}

/// Application delivery.
pub trait MessageReceiver {
    fn receive(&self, message: Message);
}

/// Channel-backed transport for tests and single-process groups.
pub mod memory {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    use cohort_core::{Destination, NodeId};
    use tokio::sync::mpsc;

    /// Shared routing table of a memory network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        senders: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Message>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Attach `node` to the network and return its transport and inbox.
        pub fn create_transport(
            self: &Arc<Self>,
            node: NodeId,
        ) -> (MemoryTransport, mpsc::UnboundedReceiver<Message>) {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Ok(mut senders) = self.senders.write() {
                senders.insert(node, tx);
            }
            (
                MemoryTransport {
                    node,
                    network: Arc::clone(self),
                },
                rx,
            )
        }

        /// Detach `node`; its inbox closes once drained.
        pub fn disconnect(&self, node: &NodeId) {
            if let Ok(mut senders) = self.senders.write() {
                senders.remove(node);
            }
        }

        pub fn connected(&self) -> Vec<NodeId> {
            self.senders
                .read()
                .map(|senders| senders.keys().copied().collect())
                .unwrap_or_default()
        }
    }

    /// Sender attached to a [`MemoryNetwork`].
    ///
    /// Group messages reach every other attached node; node messages reach
    /// their target only. Messages to unknown nodes are dropped.
    #[derive(Clone)]
    pub struct MemoryTransport {
        node: NodeId,
        network: Arc<MemoryNetwork>,
    }

    impl MemoryTransport {
        pub fn local_node_id(&self) -> NodeId {
            self.node
        }
    }

    impl MessageSender for MemoryTransport {
        fn send(&self, message: Message) {
            let Ok(senders) = self.network.senders.read() else {
                return;
            };
            match message.destination.clone() {
                Destination::Node(target) => match senders.get(&target) {
                    Some(sender) => {
                        if sender.send(message).is_err() {
                            tracing::debug!(%target, "peer inbox closed");
                        }
                    }
                    None => tracing::debug!(%target, "peer not found"),
                },
                Destination::Group(_) => {
                    for (peer, sender) in senders.iter() {
                        if *peer != self.node {
                            // Closed inboxes belong to stopped nodes.
                            let _ = sender.send(message.clone());
                        }
                    }
                }
            }
        }
    }

    /// Sender that records every message instead of routing it.
    #[derive(Default)]
    pub struct RecordingSender {
        sent: RefCell<Vec<Message>>,
    }

    impl RecordingSender {
        pub fn new() -> Self {
            Self::default()
        }

        /// Remove and return everything sent so far.
        pub fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.sent.borrow_mut())
        }

        pub fn len(&self) -> usize {
            self.sent.borrow().len()
        }

        pub fn is_empty(&self) -> bool {
            self.sent.borrow().is_empty()
        }
    }

    impl MessageSender for RecordingSender {
        fn send(&self, message: Message) {
            self.sent.borrow_mut().push(message);
        }
    }

    /// Receiver that keeps delivered messages in order.
    #[derive(Default)]
    pub struct RecordingReceiver {
        received: RefCell<Vec<Message>>,
    }

    impl RecordingReceiver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn received(&self) -> Vec<Message> {
            self.received.borrow().clone()
        }

        pub fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.received.borrow_mut())
        }
    }

    impl MessageReceiver for RecordingReceiver {
        fn receive(&self, message: Message) {
            self.received.borrow_mut().push(message);
        }
    }
}
