//! Group message envelope and the tagged message parts carried inside it.
//!
//! Protocols demultiplex on [`MessagePart`] with an exhaustive `match`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{GroupId, NodeId, ProviderId};

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Multicast to the replicated group.
    Group(GroupId),
    /// Point-to-point to a single node.
    Node(NodeId),
}

/// A message travelling through the node's event loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Originating node.
    pub source: NodeId,
    /// Target group or node.
    pub destination: Destination,
    /// The payload.
    pub part: MessagePart,
    /// Transport hint: bypass normal queues.
    pub high_priority: bool,
}

impl Message {
    /// A message multicast to `group`.
    pub fn to_group(source: NodeId, group: GroupId, part: MessagePart) -> Self {
        Self {
            source,
            destination: Destination::Group(group),
            part,
            high_priority: false,
        }
    }

    /// A message sent to a single node.
    pub fn to_node(source: NodeId, target: NodeId, part: MessagePart) -> Self {
        Self {
            source,
            destination: Destination::Node(target),
            part,
            high_priority: false,
        }
    }

    pub fn with_high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    /// Whether the message is a multicast to `group`.
    pub fn targets_group(&self, group: &GroupId) -> bool {
        matches!(&self.destination, Destination::Group(target) if target == group)
    }

    /// Accounted size in bytes, used for buffering watermarks.
    pub fn size(&self) -> usize {
        self.part.size()
    }
}

/// Payload kinds understood by the group protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePart {
    /// A joining or lagging node asks for the group state.
    StateTransferRequest,
    /// One shipment of a state transfer.
    StateTransferResponse(StateTransferResponse),
    /// Ring data-exchange payload.
    DataExchange(DataExchangePart),
    /// Application traffic; opaque to the protocols.
    Application(ApplicationPart),
}

impl MessagePart {
    pub fn size(&self) -> usize {
        match self {
            MessagePart::StateTransferRequest => 0,
            MessagePart::StateTransferResponse(_) => 0,
            MessagePart::DataExchange(part) => part.size(),
            MessagePart::Application(part) => part.kind.len() + part.payload.len(),
        }
    }
}

/// Response to a state-transfer request.
///
/// The attached file is either a snapshot (`snapshot = true`) or a message log
/// bundle. A `failed` response carries no file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransferResponse {
    pub snapshot: bool,
    pub last: bool,
    pub failed: bool,
    pub file: Option<PathBuf>,
}

impl StateTransferResponse {
    pub fn failed() -> Self {
        Self {
            snapshot: false,
            last: false,
            failed: true,
            file: None,
        }
    }

    pub fn snapshot(file: PathBuf, last: bool) -> Self {
        Self {
            snapshot: true,
            last,
            failed: false,
            file: Some(file),
        }
    }

    pub fn bundle(file: PathBuf, last: bool) -> Self {
        Self {
            snapshot: false,
            last,
            failed: false,
            file: Some(file),
        }
    }
}

/// One versioned datum for a (provider, node) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeEntry {
    pub node: NodeId,
    pub id: i64,
    pub data: Bytes,
}

/// Ring data-exchange payload: per provider, the entries being propagated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataExchangePart {
    pub providers: BTreeMap<ProviderId, Vec<ExchangeEntry>>,
}

impl DataExchangePart {
    /// Sum of the contained data sizes.
    pub fn size(&self) -> usize {
        self.providers
            .values()
            .flat_map(|entries| entries.iter())
            .map(|entry| entry.data.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.values().all(|entries| entries.is_empty())
    }
}

/// Application traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationPart {
    pub kind: String,
    pub payload: Bytes,
}

impl ApplicationPart {
    pub fn new(kind: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }
}
