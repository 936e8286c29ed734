//! Message module — PakBus packets, the common header codec and PakCtrl bodies
//!
//! This module provides:
//! - Message: header fields plus body bytes, with transaction header accessors
//! - codec: the 8-byte common header and the CSI signature algorithm
//! - pakctrl: control protocol message types, failure codes and body layouts

pub mod codec;
pub mod pakctrl;
pub mod types;

pub use codec::{append_sig_nullifier, calc_sig, calc_sig_nullifier, HEADER_LEN, SIG_SEED};
pub use pakctrl::{message_types, DeliveryFailure, FailureCode, HelloInfo, NeighbourEntry, NeighbourList};
pub use types::{
    is_valid_node_address, ExpectMore, Message, NodeAddress, OwnRoute, Priority, ProtocolType,
    BROADCAST_ADDRESS, MAX_HOP_COUNT, MAX_NODE_ADDRESS,
};

use thiserror::Error;

/// Errors raised while parsing packets and message bodies
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("Invalid protocol type: {0}")]
    InvalidProtocol(u8),

    #[error("Unexpected message type {0:#04x}")]
    UnexpectedMessageType(u8),

    #[error("Malformed message: {0}")]
    Malformed(String),
}
