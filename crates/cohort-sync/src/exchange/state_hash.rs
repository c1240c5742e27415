//! Exchange provider publishing a hash of the local check state.
//!
//! Each member publishes the BLAKE3 hash of whatever bytes the application
//! considers its comparable state. Peers whose published hash differs from
//! the local one are reported as diverged.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use cohort_core::{NodeId, ProviderId};

use super::DataExchangeProvider;

/// Provider id of the built-in state hash exchange.
pub const STATE_HASH_PROVIDER: ProviderId =
    ProviderId::from_u128(0x636f_686f_7274_2d73_7461_7465_2d68_6173);

/// A 32-byte BLAKE3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    pub fn of(state: &[u8]) -> Self {
        Self(*blake3::hash(state).as_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({}...)", &self.to_hex()[..16])
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hashes observed so far, shared between the provider and its observers.
#[derive(Debug, Default)]
pub struct StateHashes {
    local: Option<StateHash>,
    peers: BTreeMap<NodeId, StateHash>,
    cycles: u64,
}

impl StateHashes {
    pub fn local(&self) -> Option<StateHash> {
        self.local
    }

    pub fn peer(&self, node: &NodeId) -> Option<StateHash> {
        self.peers.get(node).copied()
    }

    /// Peers whose last published hash differs from the local hash.
    pub fn diverged(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, hash)| Some(**hash) != self.local)
            .map(|(node, _)| *node)
            .collect()
    }

    /// Completed round trips of the local hash.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

/// [`DataExchangeProvider`] for state hashes.
pub struct StateHashProvider {
    state: Box<dyn FnMut() -> Vec<u8>>,
    hashes: Rc<RefCell<StateHashes>>,
}

impl StateHashProvider {
    /// `state` is called on every exchange tick to produce the comparable state.
    pub fn new(state: impl FnMut() -> Vec<u8> + 'static) -> Self {
        Self {
            state: Box::new(state),
            hashes: Rc::new(RefCell::new(StateHashes::default())),
        }
    }

    /// Handle for inspecting hashes after the provider is registered.
    pub fn hashes(&self) -> Rc<RefCell<StateHashes>> {
        Rc::clone(&self.hashes)
    }
}

impl DataExchangeProvider for StateHashProvider {
    fn id(&self) -> ProviderId {
        STATE_HASH_PROVIDER
    }

    fn take_data(&mut self) -> Option<Bytes> {
        let hash = StateHash::of(&(self.state)());
        let mut hashes = self.hashes.borrow_mut();
        if hashes.local == Some(hash) {
            return None;
        }
        hashes.local = Some(hash);
        Some(Bytes::copy_from_slice(&hash.0))
    }

    fn set_data(&mut self, node: NodeId, data: Bytes) {
        match StateHash::from_slice(&data) {
            Some(hash) => {
                let mut hashes = self.hashes.borrow_mut();
                hashes.peers.insert(node, hash);
                if hashes.local.is_some() && hashes.local != Some(hash) {
                    tracing::warn!(peer = %node.short(), hash = %hash, "peer state hash differs");
                }
            }
            None => tracing::warn!(peer = %node.short(), len = data.len(), "malformed state hash"),
        }
    }

    fn on_cycle_completed(&mut self) {
        self.hashes.borrow_mut().cycles += 1;
    }
}
