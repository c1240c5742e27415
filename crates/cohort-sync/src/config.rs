//! Protocol configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for state transfer and background snapshotting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTransferConfig {
    /// Minimum time between background snapshots handed to the state store.
    pub save_snapshot_period: Duration,
    /// Maximum age of the oldest message in a session buffer before it is bundled.
    pub transfer_log_record_period: Duration,
    /// Session buffer length above which a bundle is cut immediately.
    pub transfer_log_messages_count: usize,
    /// Buffered bytes at which inbound flow is locked during a capture.
    pub min_lock_queue_capacity: usize,
    /// Directory for snapshot and message log temp files.
    pub work_dir: PathBuf,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            save_snapshot_period: Duration::from_secs(600),
            transfer_log_record_period: Duration::from_secs(1),
            transfer_log_messages_count: 10_000,
            min_lock_queue_capacity: 10 * 1024 * 1024,
            work_dir: std::env::temp_dir().join("cohort"),
        }
    }
}

impl StateTransferConfig {
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_save_snapshot_period(mut self, period: Duration) -> Self {
        self.save_snapshot_period = period;
        self
    }

    pub fn with_transfer_log_record_period(mut self, period: Duration) -> Self {
        self.transfer_log_record_period = period;
        self
    }

    pub fn with_transfer_log_messages_count(mut self, count: usize) -> Self {
        self.transfer_log_messages_count = count;
        self
    }

    pub fn with_min_lock_queue_capacity(mut self, bytes: usize) -> Self {
        self.min_lock_queue_capacity = bytes;
        self
    }
}

/// Configuration for the ring data exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataExchangeConfig {
    /// Lower bound of the delay between two sends.
    pub min_period: Duration,
    /// Upper bound of the delay between two sends.
    pub max_period: Duration,
}

impl Default for DataExchangeConfig {
    fn default() -> Self {
        Self {
            min_period: Duration::from_millis(500),
            max_period: Duration::from_millis(1000),
        }
    }
}

impl DataExchangeConfig {
    pub fn with_periods(mut self, min_period: Duration, max_period: Duration) -> Self {
        self.min_period = min_period;
        self.max_period = max_period.max(min_period);
        self
    }
}
