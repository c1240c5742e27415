//! Node configuration.

use std::time::Duration;

use cohort_core::{GroupId, NodeId};
use cohort_sync::{DataExchangeConfig, StateTransferConfig};
use serde::{Deserialize, Serialize};

/// Configuration for a [`GroupNode`](crate::GroupNode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity of this node.
    pub node_id: NodeId,
    /// The replicated group this node serves.
    pub group: GroupId,
    /// Period of the timer driving the protocols.
    #[serde(default = "default_tick_period")]
    pub tick_period: Duration,
    #[serde(default)]
    pub state_transfer: StateTransferConfig,
    #[serde(default)]
    pub data_exchange: DataExchangeConfig,
}

fn default_tick_period() -> Duration {
    Duration::from_millis(100)
}

impl NodeConfig {
    pub fn new(node_id: NodeId, group: GroupId) -> Self {
        Self {
            node_id,
            group,
            tick_period: default_tick_period(),
            state_transfer: StateTransferConfig::default(),
            data_exchange: DataExchangeConfig::default(),
        }
    }

    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }

    pub fn with_state_transfer(mut self, config: StateTransferConfig) -> Self {
        self.state_transfer = config;
        self
    }

    pub fn with_data_exchange(mut self, config: DataExchangeConfig) -> Self {
        self.data_exchange = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let node = NodeId::from_u128(7);
        let json = format!(r#"{{"node_id":"{node}","group":"orders"}}"#);
        let config: NodeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config, NodeConfig::new(node, GroupId::new("orders")));
        assert_eq!(config.tick_period, Duration::from_millis(100));
    }

    #[test]
    fn test_round_trip() {
        let config = NodeConfig::new(NodeId::from_u128(1), GroupId::new("g"))
            .with_tick_period(Duration::from_millis(20))
            .with_state_transfer(
                StateTransferConfig::default().with_transfer_log_messages_count(5),
            );
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<NodeConfig>(&json).unwrap(), config);
    }
}
