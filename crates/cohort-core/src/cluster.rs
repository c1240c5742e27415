//! Cluster collaborators consumed by the protocols.
//!
//! Failure detection, coordinator choice, and transport-level flow control are
//! provided by the surrounding node. Implementations are called from the event
//! loop thread only.

use crate::membership::Node;
use crate::types::NodeId;

/// View of member health maintained by the node's failure detector.
pub trait FailureDetector {
    /// The member currently acting as group coordinator, if any.
    fn current_coordinator(&self) -> Option<Node>;

    /// Members currently believed to be alive.
    fn healthy_members(&self) -> Vec<Node>;

    /// Members detected as failed since the last view.
    fn failed_members(&self) -> Vec<Node>;

    /// Members that left gracefully since the last view.
    fn left_members(&self) -> Vec<Node>;

    /// Whether `node` is reported as failed or left.
    fn is_unreachable(&self, node: &NodeId) -> bool {
        self.failed_members()
            .iter()
            .chain(self.left_members().iter())
            .any(|member| &member.id == node)
    }
}

/// Transport flow control: pauses and resumes inbound traffic from a source.
pub trait FlowController {
    fn lock_flow(&self, source: &NodeId);

    fn unlock_flow(&self, source: &NodeId);
}
