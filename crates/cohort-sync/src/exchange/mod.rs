//! Ring data exchange.
//!
//! Every node periodically forwards small versioned data items to the next
//! healthy member of a ring ordered by node id. Each item travels the ring
//! once: receivers adopt newer versions and forward them, and when an item
//! comes back to its origin the origin's provider completes a cycle and may
//! publish again. A datum that does not come back in time is re-issued.

pub mod state_hash;

use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cohort_core::{
    DataExchangePart, ExchangeEntry, FailureDetector, GroupMembership, LoopBound, Message,
    MessagePart, NodeId, ProviderId,
};
use rand::Rng;

use crate::config::DataExchangeConfig;
use crate::transport::MessageSender;

pub use state_hash::{StateHash, StateHashProvider, StateHashes, STATE_HASH_PROVIDER};

/// Source and sink of one kind of exchanged data.
pub trait DataExchangeProvider {
    fn id(&self) -> ProviderId;

    /// Local data changed since the last call, if any.
    fn take_data(&mut self) -> Option<Bytes>;

    /// A newer version of `node`'s data arrived.
    fn set_data(&mut self, node: NodeId, data: Bytes);

    /// The last published local data went around the ring.
    fn on_cycle_completed(&mut self);
}

#[derive(Debug, Default)]
struct LocalEntry {
    id: i64,
    data: Option<Bytes>,
    locked: bool,
    lock_time: Option<Instant>,
    modified: bool,
}

#[derive(Debug)]
struct RemoteEntry {
    id: i64,
    data: Bytes,
    modified: bool,
}

struct ProviderState {
    provider: Box<dyn DataExchangeProvider>,
    local: LocalEntry,
    remote: BTreeMap<NodeId, RemoteEntry>,
}

/// Ring exchange over all registered providers.
pub struct DataExchangeProtocol {
    local: NodeId,
    config: DataExchangeConfig,
    sender: Rc<dyn MessageSender>,
    providers: Vec<ProviderState>,
    members: HashSet<NodeId>,
    next_node: Option<NodeId>,
    group_size: usize,
    next_send: Option<Instant>,
    full_exchange: bool,
    _loop: LoopBound,
}

impl DataExchangeProtocol {
    pub fn new(local: NodeId, config: DataExchangeConfig, sender: Rc<dyn MessageSender>) -> Self {
        Self {
            local,
            config,
            sender,
            providers: Vec::new(),
            members: HashSet::new(),
            next_node: None,
            group_size: 0,
            next_send: None,
            full_exchange: false,
            _loop: LoopBound::new(),
        }
    }

    /// Register a provider. Registering an id twice replaces the provider.
    pub fn register(&mut self, provider: Box<dyn DataExchangeProvider>) {
        let id = provider.id();
        self.providers.retain(|state| state.provider.id() != id);
        self.providers.push(ProviderState {
            provider,
            local: LocalEntry::default(),
            remote: BTreeMap::new(),
        });
    }

    /// Recompute the ring after a view change.
    pub fn on_membership_changed(
        &mut self,
        membership: &GroupMembership,
        failure_detector: &dyn FailureDetector,
        now: Instant,
    ) {
        self.members = membership.members().iter().map(|node| node.id).collect();
        for state in &mut self.providers {
            let members = &self.members;
            state.remote.retain(|node, _| members.contains(node));
        }

        let mut healthy: Vec<NodeId> = failure_detector
            .healthy_members()
            .into_iter()
            .map(|node| node.id)
            .filter(|id| self.members.contains(id))
            .collect();
        if self.members.contains(&self.local) {
            healthy.push(self.local);
        }
        healthy.sort();
        healthy.dedup();
        self.group_size = healthy.len();

        let position = healthy.iter().position(|id| *id == self.local);
        let next = match position {
            Some(position) if healthy.len() >= 2 => healthy[(position + 1) % healthy.len()],
            _ => {
                self.next_node = None;
                self.next_send = None;
                for state in &mut self.providers {
                    state.local.locked = false;
                    state.local.lock_time = None;
                    state.provider.on_cycle_completed();
                }
                tracing::debug!(healthy = healthy.len(), "data exchange ring inactive");
                return;
            }
        };

        if self.next_node != Some(next) {
            tracing::debug!(next = %next.short(), size = self.group_size, "data exchange ring changed");
        }
        self.next_node = Some(next);
        self.full_exchange = true;
        self.next_send = Some(now + self.jitter());
    }

    /// Send pending exchange data when the send deadline has passed.
    pub fn on_timer(&mut self, now: Instant) {
        let Some(next) = self.next_node else {
            return;
        };
        match self.next_send {
            Some(deadline) if now >= deadline => {}
            _ => return,
        }

        let lock_timeout = self.config.max_period * self.group_size as u32;
        let full = self.full_exchange;
        let local = self.local;
        let mut part = DataExchangePart::default();

        for state in &mut self.providers {
            let entry = &mut state.local;
            if !entry.locked {
                if let Some(data) = state.provider.take_data() {
                    entry.id += 1;
                    entry.data = Some(data);
                    entry.locked = true;
                    entry.lock_time = Some(now);
                    entry.modified = true;
                }
            } else if entry
                .lock_time
                .map_or(true, |since| now.duration_since(since) > lock_timeout)
            {
                // Re-issue under a fresh version so receivers forward it again.
                entry.id += 1;
                entry.lock_time = Some(now);
                entry.modified = true;
                tracing::debug!(provider = %state.provider.id(), id = entry.id, "re-sending stalled exchange data");
            }

            let mut entries = Vec::new();
            if full || entry.modified {
                if let Some(data) = &entry.data {
                    entries.push(ExchangeEntry {
                        node: local,
                        id: entry.id,
                        data: data.clone(),
                    });
                }
            }
            entry.modified = false;

            for (node, remote) in &mut state.remote {
                if full || remote.modified {
                    entries.push(ExchangeEntry {
                        node: *node,
                        id: remote.id,
                        data: remote.data.clone(),
                    });
                }
                remote.modified = false;
            }

            if !entries.is_empty() {
                part.providers.insert(state.provider.id(), entries);
            }
        }

        if !part.providers.is_empty() {
            let message =
                Message::to_node(local, next, MessagePart::DataExchange(part)).with_high_priority();
            self.sender.send(message);
        }
        self.next_send = Some(now + self.jitter());
        self.full_exchange = false;
    }

    /// Apply an exchange payload received from `source`.
    pub fn receive(&mut self, source: NodeId, part: DataExchangePart) {
        if !self.members.contains(&source) {
            tracing::debug!(source = %source.short(), "ignoring exchange from non-member");
            return;
        }

        for (provider_id, entries) in part.providers {
            let Some(state) = self
                .providers
                .iter_mut()
                .find(|state| state.provider.id() == provider_id)
            else {
                continue;
            };

            for ExchangeEntry { node, id, data } in entries {
                if node == self.local {
                    if state.local.locked && id == state.local.id {
                        state.local.locked = false;
                        state.local.lock_time = None;
                        state.provider.on_cycle_completed();
                    }
                    continue;
                }
                if !self.members.contains(&node) {
                    continue;
                }
                let stored = state.remote.get(&node).map_or(0, |entry| entry.id);
                if id > stored {
                    state.provider.set_data(node, data.clone());
                    state.remote.insert(
                        node,
                        RemoteEntry {
                            id,
                            data,
                            modified: true,
                        },
                    );
                }
            }
        }
    }

    pub fn next_node(&self) -> Option<NodeId> {
        self.next_node
    }

    pub fn is_locked(&self, provider: ProviderId) -> bool {
        self.providers
            .iter()
            .any(|state| state.provider.id() == provider && state.local.locked)
    }

    /// Last adopted version of `node`'s data for `provider`.
    pub fn stored_id(&self, provider: ProviderId, node: &NodeId) -> Option<i64> {
        self.providers
            .iter()
            .find(|state| state.provider.id() == provider)
            .and_then(|state| state.remote.get(node))
            .map(|entry| entry.id)
    }

    fn jitter(&self) -> Duration {
        let spread = self.config.max_period.saturating_sub(self.config.min_period);
        if spread.is_zero() {
            return self.config.min_period;
        }
        let millis = rand::thread_rng().gen_range(0..=spread.as_millis() as u64);
        self.config.min_period + Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::RecordingSender;
    use cohort_core::Node;
    use proptest::prelude::*;
    use std::cell::RefCell;

    const PROVIDER: ProviderId = ProviderId::from_u128(0x5EED);

    #[derive(Default)]
    struct Log {
        pending: Option<Bytes>,
        adopted: Vec<(NodeId, Bytes)>,
        cycles: usize,
    }

    struct TestProvider(Rc<RefCell<Log>>);

    impl DataExchangeProvider for TestProvider {
        fn id(&self) -> ProviderId {
            PROVIDER
        }

        fn take_data(&mut self) -> Option<Bytes> {
            self.0.borrow_mut().pending.take()
        }

        fn set_data(&mut self, node: NodeId, data: Bytes) {
            self.0.borrow_mut().adopted.push((node, data));
        }

        fn on_cycle_completed(&mut self) {
            self.0.borrow_mut().cycles += 1;
        }
    }

    struct Healthy(Vec<Node>);

    impl FailureDetector for Healthy {
        fn current_coordinator(&self) -> Option<Node> {
            self.0.first().cloned()
        }

        fn healthy_members(&self) -> Vec<Node> {
            self.0.clone()
        }

        fn failed_members(&self) -> Vec<Node> {
            Vec::new()
        }

        fn left_members(&self) -> Vec<Node> {
            Vec::new()
        }
    }

    fn node(n: u128) -> Node {
        Node::new(
            NodeId::from_u128(n),
            format!("127.0.0.1:{}", 7000 + n).parse().unwrap(),
            "core",
        )
    }

    fn config() -> DataExchangeConfig {
        DataExchangeConfig::default()
            .with_periods(Duration::from_millis(100), Duration::from_millis(100))
    }

    struct Peer {
        protocol: DataExchangeProtocol,
        sender: Rc<RecordingSender>,
        log: Rc<RefCell<Log>>,
    }

    fn peer(n: u128, members: &[Node], now: Instant) -> Peer {
        let sender = Rc::new(RecordingSender::new());
        let log = Rc::new(RefCell::new(Log::default()));
        let mut protocol = DataExchangeProtocol::new(NodeId::from_u128(n), config(), sender.clone());
        protocol.register(Box::new(TestProvider(log.clone())));
        let view = GroupMembership::new(1, members.to_vec()).unwrap();
        protocol.on_membership_changed(&view, &Healthy(members.to_vec()), now);
        Peer {
            protocol,
            sender,
            log,
        }
    }

    fn exchanged(sender: &RecordingSender) -> Vec<(NodeId, NodeId, DataExchangePart)> {
        sender
            .take()
            .into_iter()
            .map(|message| match (message.destination, message.part) {
                (cohort_core::Destination::Node(target), MessagePart::DataExchange(part)) => {
                    assert!(message.high_priority);
                    (message.source, target, part)
                }
                other => panic!("unexpected message {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_next_node_follows_sorted_ring() {
        let now = Instant::now();
        let members = [node(3), node(1), node(2)];
        assert_eq!(peer(1, &members, now).protocol.next_node(), Some(NodeId::from_u128(2)));
        assert_eq!(peer(2, &members, now).protocol.next_node(), Some(NodeId::from_u128(3)));
        assert_eq!(peer(3, &members, now).protocol.next_node(), Some(NodeId::from_u128(1)));
    }

    #[test]
    fn test_single_member_unlocks_and_notifies() {
        let now = Instant::now();
        let members = [node(1), node(2)];
        let mut a = peer(1, &members, now);
        a.log.borrow_mut().pending = Some(Bytes::from_static(b"x"));
        a.protocol.on_timer(now + Duration::from_millis(100));
        assert!(a.protocol.is_locked(PROVIDER));

        let alone = GroupMembership::new(2, vec![node(1)]).unwrap();
        a.protocol
            .on_membership_changed(&alone, &Healthy(vec![node(1)]), now);

        assert_eq!(a.protocol.next_node(), None);
        assert!(!a.protocol.is_locked(PROVIDER));
        assert_eq!(a.log.borrow().cycles, 1);
    }

    #[test]
    fn test_ring_cycle_completes_once_at_origin() {
        let now = Instant::now();
        let members = [node(1), node(2), node(3)];
        let mut peers: Vec<Peer> = (1..=3).map(|n| peer(n, &members, now)).collect();
        let tick = now + Duration::from_millis(100);

        // Let the initial full exchanges drain; nobody has data yet.
        for p in &mut peers {
            p.protocol.on_timer(tick);
            assert!(p.sender.is_empty());
        }

        peers[0].log.borrow_mut().pending = Some(Bytes::from_static(b"v1"));
        let mut at = tick;
        for hop in 0..3 {
            at += Duration::from_millis(100);
            for p in &mut peers {
                p.protocol.on_timer(at);
            }
            let mut messages = Vec::new();
            for p in &peers {
                messages.extend(exchanged(&p.sender));
            }
            assert_eq!(peers[0].log.borrow().cycles, 0, "completed early at hop {hop}");
            for (source, target, part) in messages {
                let index = peers
                    .iter()
                    .position(|p| p.protocol.local == target)
                    .unwrap();
                peers[index].protocol.receive(source, part);
            }
        }

        assert_eq!(peers[0].log.borrow().cycles, 1);
        assert!(!peers[0].protocol.is_locked(PROVIDER));
        for p in &peers[1..] {
            assert_eq!(
                p.log.borrow().adopted,
                vec![(NodeId::from_u128(1), Bytes::from_static(b"v1"))]
            );
        }
    }

    #[test]
    fn test_never_adopts_stale_or_equal_ids() {
        let now = Instant::now();
        let members = [node(1), node(2), node(3)];
        let mut b = peer(2, &members, now);
        let origin = NodeId::from_u128(1);
        let payload = |id: i64, data: &'static [u8]| {
            let mut part = DataExchangePart::default();
            part.providers.insert(
                PROVIDER,
                vec![ExchangeEntry {
                    node: origin,
                    id,
                    data: Bytes::from_static(data),
                }],
            );
            part
        };

        b.protocol.receive(origin, payload(5, b"five"));
        b.protocol.receive(origin, payload(5, b"again"));
        b.protocol.receive(origin, payload(4, b"older"));

        assert_eq!(b.log.borrow().adopted.len(), 1);
        assert_eq!(b.protocol.stored_id(PROVIDER, &origin), Some(5));
    }

    #[test]
    fn test_ignores_non_members_and_unknown_providers() {
        let now = Instant::now();
        let members = [node(1), node(2)];
        let mut b = peer(2, &members, now);
        let stranger = NodeId::from_u128(9);

        let mut part = DataExchangePart::default();
        part.providers.insert(
            PROVIDER,
            vec![
                ExchangeEntry { node: stranger, id: 1, data: Bytes::from_static(b"s") },
                ExchangeEntry { node: NodeId::from_u128(1), id: 1, data: Bytes::from_static(b"a") },
            ],
        );
        part.providers.insert(
            ProviderId::from_u128(0xDEAD),
            vec![ExchangeEntry { node: NodeId::from_u128(1), id: 1, data: Bytes::new() }],
        );

        b.protocol.receive(stranger, part.clone());
        assert!(b.log.borrow().adopted.is_empty());

        b.protocol.receive(NodeId::from_u128(1), part);
        assert_eq!(
            b.log.borrow().adopted,
            vec![(NodeId::from_u128(1), Bytes::from_static(b"a"))]
        );
    }

    #[test]
    fn test_stalled_lock_is_resent() {
        let now = Instant::now();
        let members = [node(1), node(2)];
        let mut a = peer(1, &members, now);
        a.log.borrow_mut().pending = Some(Bytes::from_static(b"x"));

        let first = now + Duration::from_millis(100);
        a.protocol.on_timer(first);
        let sent = exchanged(&a.sender);
        assert_eq!(sent[0].2.providers[&PROVIDER][0].id, 1);

        // Within the lock timeout nothing is re-sent.
        a.protocol.on_timer(first + Duration::from_millis(150));
        assert!(a.sender.is_empty());

        a.protocol.on_timer(first + Duration::from_millis(300));
        let resent = exchanged(&a.sender);
        assert_eq!(resent[0].2.providers[&PROVIDER][0].id, 2);
        assert!(a.protocol.is_locked(PROVIDER));
    }

    proptest! {
        #[test]
        fn stored_id_tracks_highest_seen(ids in prop::collection::vec(1i64..50, 1..40)) {
            let now = Instant::now();
            let members = [node(1), node(2)];
            let mut b = peer(2, &members, now);
            let origin = NodeId::from_u128(1);

            let mut highest = 0;
            let mut increases = 0;
            for id in &ids {
                if *id > highest {
                    highest = *id;
                    increases += 1;
                }
                let mut part = DataExchangePart::default();
                part.providers.insert(
                    PROVIDER,
                    vec![ExchangeEntry { node: origin, id: *id, data: Bytes::from_static(b"d") }],
                );
                b.protocol.receive(origin, part);
            }

            prop_assert_eq!(b.protocol.stored_id(PROVIDER, &origin), Some(highest));
            prop_assert_eq!(b.log.borrow().adopted.len(), increases);
        }
    }

    #[test]
    fn test_jitter_is_min_when_periods_equal() {
        let protocol = DataExchangeProtocol::new(
            NodeId::from_u128(1),
            config(),
            Rc::new(RecordingSender::new()),
        );
        assert_eq!(protocol.jitter(), Duration::from_millis(100));
    }
}
