//! # Cohort
//!
//! Group state transfer and membership synchronization for replicated
//! cluster nodes.
//!
//! A [`GroupNode`] runs the protocols every member of a replicated group
//! needs:
//!
//! - **State transfer**: a joining node fetches a snapshot of the group state
//!   from a member, followed by the state-changing messages applied after the
//!   snapshot, shipped as CRC-protected message log bundles.
//! - **Flush participation**: view changes wait until no snapshot capture is
//!   outstanding.
//! - **Background snapshots**: the coordinator periodically persists the group
//!   state in a [`StateStore`](store::StateStore); a forming group restores it.
//! - **Data exchange**: small versioned data items circulate around a ring of
//!   healthy members, e.g. state hashes for divergence detection.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cohort::{GroupNode, NodeConfig, NodeServices};
//!
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async move {
//!     let (node, handle) = GroupNode::new(config, services, inbox)?;
//!     tokio::task::spawn_local(node.run());
//!     handle.install_membership(view)?;
//!     handle.request_state(coordinator)?;
//!     # Ok::<_, cohort::NodeError>(())
//! }).await?;
//! ```
//!
//! ## Re-exports
//!
//! - `cohort::core` - Identifiers, views, flushes, message parts
//! - `cohort::store` - Message log codec and state stores
//! - `cohort::sync` - State transfer and data exchange protocols

pub mod config;
pub mod error;
pub mod node;

pub use cohort_core as core;
pub use cohort_store as store;
pub use cohort_sync as sync;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::{GroupNode, NodeEvent, NodeHandle, NodeServices, NodeStatus};

pub use cohort_core::{
    ApplicationPart, Flush, GroupId, GroupMembership, Message, MessagePart, Node, NodeId,
};
