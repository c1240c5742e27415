//! # Cohort Core
//!
//! Pure primitives shared by every cohort crate: identifiers, group views,
//! flush sessions, and the message parts exchanged between group members.
//!
//! This crate contains no I/O and no protocol logic.
//!
//! ## Key Types
//!
//! - [`NodeId`] - Stable identity of a cluster node
//! - [`GroupMembership`] - An immutable, versioned view of the group
//! - [`Flush`] - A view-change barrier with per-participant grant bookkeeping
//! - [`Message`] / [`MessagePart`] - Envelope and tagged payload of a group message
//! - [`LoopBound`] - Marker pinning protocol state to the event-loop thread

pub mod cluster;
pub mod error;
pub mod local;
pub mod membership;
pub mod message;
pub mod types;

pub use cluster::{FailureDetector, FlowController};
pub use error::{CoreError, Result};
pub use local::LoopBound;
pub use membership::{Flush, GroupMembership, MembershipChange, Node};
pub use message::{
    ApplicationPart, DataExchangePart, Destination, ExchangeEntry, Message, MessagePart,
    StateTransferResponse,
};
pub use types::{GroupId, NodeId, ProviderId};
