//! # Cohort Sync
//!
//! Group protocols run by every cohort node on its event loop:
//!
//! - **State transfer**: a member ships its application state to a joining
//!   node as a snapshot followed by message log bundles, while holding back
//!   state-changing traffic during captures and taking part in flushes.
//! - **Data exchange**: small versioned data items circulate around a ring of
//!   healthy members ordered by node id.
//!
//! Protocol state is `!Send` and is only touched from the event loop. File
//! I/O runs in [`Task`]s on a [`TaskExecutor`]; completions come back to the
//! loop as [`TaskCompletion`]s.

pub mod app;
pub mod config;
pub mod error;
pub mod exchange;
pub mod flush;
pub mod task;
pub mod transfer;
pub mod transport;

pub use app::{StateTransferClient, StateTransferServer};
pub use config::{DataExchangeConfig, StateTransferConfig};
pub use error::{Result, SyncError};
pub use exchange::{
    DataExchangeProtocol, DataExchangeProvider, StateHash, StateHashProvider, StateHashes,
    STATE_HASH_PROVIDER,
};
pub use flush::FlushParticipant;
pub use task::{
    CancelToken, ManualTaskExecutor, MessageSink, ReplayBatch, ReplaySink, Task, TaskCompletion,
    TaskExecutor, TaskHandle, TaskId, TaskOutput, TokioTaskExecutor,
};
pub use transfer::{
    ClientState, Collaborators, SessionEvent, SessionFactory, SessionState,
    StateTransferClientProtocol, StateTransferServerProtocol, StateTransferSession,
    TransferContext, STATE_TRANSFER_PARTICIPANT,
};
pub use transport::{MessageReceiver, MessageSender};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StateTransferConfig::default();
        assert_eq!(config.save_snapshot_period.as_secs(), 600);
        assert_eq!(config.transfer_log_record_period.as_secs(), 1);
        assert_eq!(config.transfer_log_messages_count, 10_000);
        assert_eq!(config.min_lock_queue_capacity, 10 * 1024 * 1024);

        let exchange = DataExchangeConfig::default();
        assert!(exchange.min_period <= exchange.max_period);
    }
}
