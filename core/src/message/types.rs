// Message types — PakBus packets as the router sees them

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ProtocolError;
use crate::transport::PortId;

/// 12-bit PakBus node address
pub type NodeAddress = u16;

/// Destination that reaches every node on a link
pub const BROADCAST_ADDRESS: NodeAddress = 4095;

/// Largest address a node may own
pub const MAX_NODE_ADDRESS: NodeAddress = 4094;

/// Hop count beyond which messages are no longer forwarded
pub const MAX_HOP_COUNT: u8 = 15;

/// Returns true if `address` can name a single node
pub fn is_valid_node_address(address: NodeAddress) -> bool {
    address > 0 && address <= MAX_NODE_ADDRESS
}

/// High level protocol carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtocolType {
    /// PakCtrl: routing and management commands
    Control = 0,
    /// BMP5: application data exchanges
    Bmp5 = 1,
    /// Unacknowledged datagram
    Datagram = 2,
    /// Encryption envelope around one of the others
    Encrypted = 3,
}

impl ProtocolType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(ProtocolType::Control),
            1 => Ok(ProtocolType::Bmp5),
            2 => Ok(ProtocolType::Datagram),
            3 => Ok(ProtocolType::Encrypted),
            other => Err(ProtocolError::InvalidProtocol(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control and BMP5 bodies start with message type and transaction number
    pub fn has_transaction_header(self) -> bool {
        matches!(self, ProtocolType::Control | ProtocolType::Bmp5)
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolType::Control => write!(f, "PakCtrl"),
            ProtocolType::Bmp5 => write!(f, "BMP5"),
            ProtocolType::Datagram => write!(f, "Datagram"),
            ProtocolType::Encrypted => write!(f, "Encrypted"),
        }
    }
}

/// Message priority, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    ExtraHigh = 3,
}

impl Priority {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::ExtraHigh,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Tells the receiving link whether more traffic follows in this exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExpectMore {
    /// No more messages are expected
    Last = 0,
    /// The sender expects further messages
    #[default]
    ExpectMore = 1,
    Neutral = 2,
    /// The receiver should expect to send more
    Reverse = 3,
}

impl ExpectMore {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => ExpectMore::Last,
            1 => ExpectMore::ExpectMore,
            2 => ExpectMore::Neutral,
            _ => ExpectMore::Reverse,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Caller supplied routing for a message that has no table route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnRoute {
    pub port: PortId,
    pub physical_destination: NodeAddress,
}

/// A PakBus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol: ProtocolType,
    pub priority: Priority,
    pub expect_more: ExpectMore,
    pub hop_count: u8,
    pub source: NodeAddress,
    pub destination: NodeAddress,
    /// Link-level sender, filled by the receiving port
    pub physical_source: NodeAddress,
    /// Link-level receiver, filled when the router hands the message to a port
    pub physical_destination: NodeAddress,
    /// Link should be closed once this message is delivered
    pub will_close: bool,
    /// Encrypt if a cipher is registered for the destination
    pub should_encrypt: bool,
    pub own_route: Option<OwnRoute>,
    /// Everything after the common header
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(protocol: ProtocolType, body: Vec<u8>) -> Self {
        Self {
            protocol,
            priority: Priority::Normal,
            expect_more: ExpectMore::ExpectMore,
            hop_count: 0,
            source: 0,
            destination: 0,
            physical_source: 0,
            physical_destination: 0,
            will_close: false,
            should_encrypt: true,
            own_route: None,
            body,
        }
    }

    /// Build a PakCtrl message
    pub fn pakctrl(message_type: u8, transaction_no: u8, payload: &[u8]) -> Self {
        Self::with_transaction_header(ProtocolType::Control, message_type, transaction_no, payload)
    }

    /// Build a BMP5 message
    pub fn bmp5(message_type: u8, transaction_no: u8, payload: &[u8]) -> Self {
        Self::with_transaction_header(ProtocolType::Bmp5, message_type, transaction_no, payload)
    }

    fn with_transaction_header(
        protocol: ProtocolType,
        message_type: u8,
        transaction_no: u8,
        payload: &[u8],
    ) -> Self {
        let mut body = Vec::with_capacity(2 + payload.len());
        body.push(message_type);
        body.push(transaction_no);
        body.extend_from_slice(payload);
        Self::new(protocol, body)
    }

    pub fn with_destination(mut self, destination: NodeAddress) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn has_transaction_header(&self) -> bool {
        self.protocol.has_transaction_header() && self.body.len() >= 2
    }

    pub fn message_type(&self) -> Option<u8> {
        if self.has_transaction_header() {
            Some(self.body[0])
        } else {
            None
        }
    }

    pub fn transaction_no(&self) -> Option<u8> {
        if self.has_transaction_header() {
            Some(self.body[1])
        } else {
            None
        }
    }

    pub fn set_transaction_no(&mut self, transaction_no: u8) {
        if self.has_transaction_header() {
            self.body[1] = transaction_no;
        }
    }

    /// Bytes following the transaction header (or the whole body if there is none)
    pub fn payload(&self) -> &[u8] {
        if self.has_transaction_header() {
            &self.body[2..]
        } else {
            &self.body
        }
    }

    /// Responses carry the top bit of the message type
    pub fn is_response(&self) -> bool {
        self.message_type().map(|t| t & 0x80 != 0).unwrap_or(false)
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST_ADDRESS
    }

    /// Total encoded length including the common header
    pub fn encoded_len(&self) -> usize {
        super::codec::HEADER_LEN + self.body.len()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} (hops {}, {} bytes",
            self.protocol,
            self.source,
            self.destination,
            self.hop_count,
            self.encoded_len()
        )?;
        if let (Some(t), Some(n)) = (self.message_type(), self.transaction_no()) {
            write!(f, ", type {:#04x}, tran {}", t, n)?;
        }
        write!(f, ")")
    }
}
