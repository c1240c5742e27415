//! Application hooks for state transfer.
//!
//! The replicated application owns its state; cohort only decides when to
//! capture or restore it and which messages change it. Hooks are invoked from
//! worker threads.

use std::io;
use std::path::Path;

use cohort_core::MessagePart;

/// Serving side of the application.
pub trait StateTransferServer: Send + Sync {
    /// Write a consistent snapshot of the application state into `file`.
    fn save_snapshot(&self, file: &Path) -> io::Result<()>;

    /// Whether applying `part` changes the replicated state.
    fn is_modifying_message(&self, part: &MessagePart) -> bool;
}

/// Receiving side of the application.
pub trait StateTransferClient: Send + Sync {
    /// Replace the application state with the snapshot in `file`.
    fn load_snapshot(&self, file: &Path) -> io::Result<()>;
}
