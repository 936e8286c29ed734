// Router configuration
//
// Everything a router instance needs to know about itself. Loaded from JSON
// by applications; unknown fields are ignored and missing fields take their
// defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::crypto::EnvelopeByteOrder;
use crate::message::{is_valid_node_address, NodeAddress, BROADCAST_ADDRESS, MAX_HOP_COUNT};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid node address: {0}")]
    InvalidNodeAddress(NodeAddress),

    #[error("max_hop_count must be between 1 and {max}, got {got}")]
    InvalidMaxHopCount { got: u8, max: u8 },

    #[error("{0} must be > 0")]
    ZeroValue(&'static str),

    #[error("Invalid cipher slot: {0}")]
    InvalidCipherSlot(NodeAddress),

    #[error("Empty passphrase for cipher slot {0}")]
    EmptyPassphrase(NodeAddress),
}

/// Router settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// PakBus address of this node
    pub this_node_address: NodeAddress,
    /// Leaf nodes never forward and never sync neighbour lists
    pub is_leaf_node: bool,
    pub max_hop_count: u8,
    pub maintenance_interval_msec: u32,
    /// How often the router state is dumped at debug level
    pub debug_snapshot_interval_msec: u32,
    /// Age after which a queued message on an uncapped active port is failed
    pub unrouted_max_age_msec: u32,
    /// Response timeout before route latency is added
    pub transaction_base_timeout_msec: u32,
    /// How long the focus holder may go without a route
    pub unroutable_grace_msec: u32,
    pub terminate_give_up_msec: u32,
    pub max_hello_tries: u32,
    pub hello_retry_delay_msec: u32,
    pub neighbour_list_retry_delay_msec: u32,
    /// Retries after a timeout for client transactions
    pub max_tran_retries: u32,
    /// Reject plaintext application traffic from nodes we hold a cipher for
    pub require_encryption: bool,
    pub envelope_byte_order: EnvelopeByteOrder,
    /// Passphrases by peer address; 4095 is the default for every peer
    pub ciphers: BTreeMap<NodeAddress, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            this_node_address: 4094,
            is_leaf_node: false,
            max_hop_count: MAX_HOP_COUNT,
            maintenance_interval_msec: 1_000,
            debug_snapshot_interval_msec: 600_000,
            unrouted_max_age_msec: 1_200_000,
            transaction_base_timeout_msec: 5_000,
            unroutable_grace_msec: 10_000,
            terminate_give_up_msec: 40_000,
            max_hello_tries: 4,
            hello_retry_delay_msec: 10_000,
            neighbour_list_retry_delay_msec: 30_000,
            max_tran_retries: 3,
            require_encryption: false,
            envelope_byte_order: EnvelopeByteOrder::BigEndian,
            ciphers: BTreeMap::new(),
        }
    }
}

impl RouterConfig {
    /// Config for a router at `address` with everything else defaulted
    pub fn for_node(address: NodeAddress) -> Self {
        Self {
            this_node_address: address,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_node_address(self.this_node_address) {
            return Err(ConfigError::InvalidNodeAddress(self.this_node_address));
        }
        if self.max_hop_count == 0 || self.max_hop_count > MAX_HOP_COUNT {
            return Err(ConfigError::InvalidMaxHopCount {
                got: self.max_hop_count,
                max: MAX_HOP_COUNT,
            });
        }
        let non_zero = [
            ("maintenance_interval_msec", self.maintenance_interval_msec),
            ("debug_snapshot_interval_msec", self.debug_snapshot_interval_msec),
            ("unrouted_max_age_msec", self.unrouted_max_age_msec),
            ("transaction_base_timeout_msec", self.transaction_base_timeout_msec),
            ("unroutable_grace_msec", self.unroutable_grace_msec),
            ("terminate_give_up_msec", self.terminate_give_up_msec),
            ("max_hello_tries", self.max_hello_tries),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue(*name));
        }
        for (address, passphrase) in &self.ciphers {
            if !is_valid_node_address(*address) && *address != BROADCAST_ADDRESS {
                return Err(ConfigError::InvalidCipherSlot(*address));
            }
            if passphrase.is_empty() {
                return Err(ConfigError::EmptyPassphrase(*address));
            }
        }
        Ok(())
    }
}
