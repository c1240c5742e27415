//! Group views and view-change (flush) sessions.
//!
//! A [`GroupMembership`] is replaced wholesale on every view change and never
//! mutated in place. A [`Flush`] is the barrier that moves the group from one
//! view to the next; it is created by the flush coordinator and every
//! participant records its grant in the shared grant table.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::NodeId;

/// A cluster node as published in a view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: SocketAddr,
    pub domain: String,
}

impl Node {
    pub fn new(id: NodeId, address: SocketAddr, domain: impl Into<String>) -> Self {
        Self {
            id,
            address,
            domain: domain.into(),
        }
    }
}

/// An agreed view of the group: a monotonically increasing id plus members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    id: u64,
    members: Vec<Node>,
}

impl GroupMembership {
    /// Create a view. Member ids must be unique.
    pub fn new(id: u64, members: Vec<Node>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(members.len());
        for member in &members {
            if !seen.insert(member.id) {
                return Err(CoreError::InvalidMembership(format!(
                    "duplicate member {} in view {}",
                    member.id, id
                )));
            }
        }
        Ok(Self { id, members })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn members(&self) -> &[Node] {
        &self.members
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.iter().any(|member| &member.id == node)
    }

    pub fn find(&self, node: &NodeId) -> Option<&Node> {
        self.members.iter().find(|member| &member.id == node)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Difference between two consecutive views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub joined: Vec<Node>,
    pub left: Vec<Node>,
    pub failed: Vec<Node>,
}

impl MembershipChange {
    /// Compute joined and left members between two views.
    ///
    /// The views alone cannot tell a failure from a graceful leave, so every
    /// removed member is reported as left.
    pub fn between(old: &GroupMembership, new: &GroupMembership) -> Self {
        let joined = new
            .members()
            .iter()
            .filter(|member| !old.contains(&member.id))
            .cloned()
            .collect();
        let left = old
            .members()
            .iter()
            .filter(|member| !new.contains(&member.id))
            .cloned()
            .collect();
        Self {
            joined,
            left,
            failed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.failed.is_empty()
    }
}

/// A view-change barrier.
///
/// Cloning a flush shares its grant table, so the coordinator and every
/// participant observe the same grants.
#[derive(Debug, Clone)]
pub struct Flush {
    id: u64,
    old_membership: Option<GroupMembership>,
    new_membership: GroupMembership,
    membership_change: Option<MembershipChange>,
    group_forming: bool,
    grants: Rc<RefCell<BTreeMap<String, bool>>>,
}

impl Flush {
    /// Create a flush moving the group from `old_membership` to `new_membership`.
    pub fn new(
        id: u64,
        old_membership: Option<GroupMembership>,
        new_membership: GroupMembership,
    ) -> Self {
        let membership_change = old_membership
            .as_ref()
            .map(|old| MembershipChange::between(old, &new_membership));
        Self {
            id,
            old_membership,
            new_membership,
            membership_change,
            group_forming: false,
            grants: Rc::new(RefCell::new(BTreeMap::new())),
        }
    }

    /// Mark this flush as forming a new group (no prior agreed state).
    pub fn forming(mut self) -> Self {
        self.group_forming = true;
        self
    }

    /// Override the computed membership change (e.g. to report failures).
    pub fn with_change(mut self, change: MembershipChange) -> Self {
        self.membership_change = Some(change);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn old_membership(&self) -> Option<&GroupMembership> {
        self.old_membership.as_ref()
    }

    pub fn new_membership(&self) -> &GroupMembership {
        &self.new_membership
    }

    pub fn membership_change(&self) -> Option<&MembershipChange> {
        self.membership_change.as_ref()
    }

    pub fn is_group_forming(&self) -> bool {
        self.group_forming
    }

    /// Record that `participant` is ready for the flush to proceed.
    pub fn grant(&self, participant: &str) {
        self.grants.borrow_mut().insert(participant.to_string(), true);
    }

    /// Withdraw a previously given grant.
    pub fn revoke(&self, participant: &str) {
        self.grants.borrow_mut().insert(participant.to_string(), false);
    }

    pub fn is_granted(&self, participant: &str) -> bool {
        self.grants
            .borrow()
            .get(participant)
            .copied()
            .unwrap_or(false)
    }

    /// Whether every named participant currently holds a grant.
    pub fn all_granted<'a>(&self, participants: impl IntoIterator<Item = &'a str>) -> bool {
        participants
            .into_iter()
            .all(|participant| self.is_granted(participant))
    }
}
