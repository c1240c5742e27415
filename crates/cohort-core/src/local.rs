//! Single-thread ownership marker.
//!
//! Every protocol in cohort is mutated only from the node's event loop. Embedding
//! [`LoopBound`] makes the owning struct `!Send` and `!Sync`, so the compiler
//! rejects any attempt to move protocol state to another thread or share it
//! behind a lock.

use std::fmt;
use std::marker::PhantomData;

/// Zero-sized `!Send + !Sync` marker for event-loop owned state.
#[derive(Clone, Copy, Default)]
pub struct LoopBound(PhantomData<*const ()>);

impl LoopBound {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl fmt::Debug for LoopBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoopBound")
    }
}
