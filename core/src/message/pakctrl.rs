// PakCtrl — message types, failure codes and body layouts of the control protocol

use serde::{Deserialize, Serialize};
use std::fmt;

use super::codec::HEADER_LEN;
use super::types::{Message, NodeAddress};
use super::ProtocolError;
use crate::hop_metric::HopMetric;

/// PakCtrl message type codes
pub mod message_types {
    pub const DELIVERY_FAILURE: u8 = 0x81;
    pub const ECHO_CMD: u8 = 0x05;
    pub const ECHO_ACK: u8 = 0x85;
    pub const RELAY_ECHO_CMD: u8 = 0x06;
    pub const RELAY_ECHO_ACK: u8 = 0x86;
    pub const GET_STRING_SETTINGS_CMD: u8 = 0x07;
    pub const GET_STRING_SETTINGS_ACK: u8 = 0x87;
    pub const SET_STRING_SETTINGS_CMD: u8 = 0x08;
    pub const SET_STRING_SETTINGS_ACK: u8 = 0x88;
    pub const HELLO_CMD: u8 = 0x09;
    pub const HELLO_ACK: u8 = 0x89;
    pub const GET_NEIGHBOURS_CMD: u8 = 0x0a;
    pub const GET_NEIGHBOURS_ACK: u8 = 0x8a;
    pub const SEND_NEIGHBOURS_CMD: u8 = 0x0c;
    pub const SEND_NEIGHBOURS_ACK: u8 = 0x8c;
    pub const BYE_CMD: u8 = 0x0d;
    pub const HELLO_REQUEST: u8 = 0x0e;
}

/// Delivery failure codes carried in PakCtrl failure reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    UnreachableDestination,
    UnreachableHighLevelProtocol,
    TimedOutOrResourceError,
    UnsupportedMessageType,
    MalformedMessage,
    FailedStaticRoute,
    PacketTooBig64,
    PacketTooBig90,
    PacketTooBig128,
    PacketTooBig256,
    PacketTooBig512,
    UnsupportedEncryptionCipher,
    EncryptionRequired,
    Unknown(u8),
}

impl FailureCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => FailureCode::UnreachableDestination,
            2 => FailureCode::UnreachableHighLevelProtocol,
            3 => FailureCode::TimedOutOrResourceError,
            4 => FailureCode::UnsupportedMessageType,
            5 => FailureCode::MalformedMessage,
            6 => FailureCode::FailedStaticRoute,
            7 => FailureCode::PacketTooBig64,
            8 => FailureCode::PacketTooBig90,
            9 => FailureCode::PacketTooBig128,
            10 => FailureCode::PacketTooBig256,
            11 => FailureCode::PacketTooBig512,
            12 => FailureCode::UnsupportedEncryptionCipher,
            13 => FailureCode::EncryptionRequired,
            other => FailureCode::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FailureCode::UnreachableDestination => 1,
            FailureCode::UnreachableHighLevelProtocol => 2,
            FailureCode::TimedOutOrResourceError => 3,
            FailureCode::UnsupportedMessageType => 4,
            FailureCode::MalformedMessage => 5,
            FailureCode::FailedStaticRoute => 6,
            FailureCode::PacketTooBig64 => 7,
            FailureCode::PacketTooBig90 => 8,
            FailureCode::PacketTooBig128 => 9,
            FailureCode::PacketTooBig256 => 10,
            FailureCode::PacketTooBig512 => 11,
            FailureCode::UnsupportedEncryptionCipher => 12,
            FailureCode::EncryptionRequired => 13,
            FailureCode::Unknown(other) => other,
        }
    }

    pub fn is_packet_too_big(self) -> bool {
        matches!(
            self,
            FailureCode::PacketTooBig64
                | FailureCode::PacketTooBig90
                | FailureCode::PacketTooBig128
                | FailureCode::PacketTooBig256
                | FailureCode::PacketTooBig512
        )
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCode::UnreachableDestination => write!(f, "unreachable destination"),
            FailureCode::UnreachableHighLevelProtocol => write!(f, "unreachable high level protocol"),
            FailureCode::TimedOutOrResourceError => write!(f, "timed out or resource error"),
            FailureCode::UnsupportedMessageType => write!(f, "unsupported message type"),
            FailureCode::MalformedMessage => write!(f, "malformed message"),
            FailureCode::FailedStaticRoute => write!(f, "failed static route"),
            FailureCode::PacketTooBig64 => write!(f, "packet too big (64)"),
            FailureCode::PacketTooBig90 => write!(f, "packet too big (90)"),
            FailureCode::PacketTooBig128 => write!(f, "packet too big (128)"),
            FailureCode::PacketTooBig256 => write!(f, "packet too big (256)"),
            FailureCode::PacketTooBig512 => write!(f, "packet too big (512)"),
            FailureCode::UnsupportedEncryptionCipher => write!(f, "unsupported encryption cipher"),
            FailureCode::EncryptionRequired => write!(f, "encryption required"),
            FailureCode::Unknown(code) => write!(f, "unknown failure {}", code),
        }
    }
}

/// Bytes of the failed message quoted in a failure report
const FAILURE_QUOTE_LEN: usize = 16;

/// Body of a delivery failure report
pub fn delivery_failure_body(code: FailureCode, failed: &Message) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + FAILURE_QUOTE_LEN);
    body.push(code.as_u8());
    let bytes = failed.to_bytes();
    body.extend_from_slice(&bytes[..bytes.len().min(FAILURE_QUOTE_LEN)]);
    body
}

/// A parsed delivery failure report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub code: FailureCode,
    /// Header of the message that could not be delivered
    pub failed: Message,
}

impl DeliveryFailure {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 1 + HEADER_LEN {
            return Err(ProtocolError::BufferTooShort {
                need: 1 + HEADER_LEN,
                got: payload.len(),
            });
        }
        let code = FailureCode::from_u8(payload[0]);
        let failed = Message::from_bytes(&payload[1..])?;
        Ok(Self { code, failed })
    }
}

/// Link parameters exchanged by hello command and acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloInfo {
    pub is_router: bool,
    pub hop_metric: HopMetric,
    /// Seconds; zero when the sender does not verify
    pub verify_interval: u16,
}

impl HelloInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = vec![self.is_router as u8, self.hop_metric.code()];
        body.extend_from_slice(&self.verify_interval.to_be_bytes());
        body
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::BufferTooShort {
                need: 4,
                got: payload.len(),
            });
        }
        Ok(Self {
            is_router: payload[0] != 0,
            hop_metric: HopMetric::from_code(payload[1]),
            verify_interval: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }
}

/// One entry of a neighbour list: `is_router(1) | hop_metric(3) | address(12)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourEntry {
    pub address: NodeAddress,
    pub is_router: bool,
    pub hop_metric: HopMetric,
}

impl NeighbourEntry {
    pub fn pack(&self) -> u16 {
        ((self.is_router as u16) << 15)
            | ((self.hop_metric.code() as u16) << 12)
            | (self.address & 0x0fff)
    }

    pub fn unpack(value: u16) -> Self {
        Self {
            address: value & 0x0fff,
            is_router: value & 0x8000 != 0,
            hop_metric: HopMetric::from_code(((value >> 12) & 0x07) as u8),
        }
    }
}

fn encode_entries(body: &mut Vec<u8>, entries: &[NeighbourEntry]) {
    for entry in entries {
        body.extend_from_slice(&entry.pack().to_be_bytes());
    }
}

fn parse_entries(bytes: &[u8]) -> Result<Vec<NeighbourEntry>, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::Malformed("odd neighbour list length".into()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| NeighbourEntry::unpack(u16::from_be_bytes([pair[0], pair[1]])))
        .collect())
}

/// A neighbour list as exchanged between routers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeighbourList {
    /// The sender's whole neighbour list at `version`
    Complete {
        version: u8,
        entries: Vec<NeighbourEntry>,
    },
    /// Changes that take a receiver at `base_version` to `version`
    Incremental {
        version: u8,
        base_version: u8,
        added: Vec<NeighbourEntry>,
        removed: Vec<NeighbourEntry>,
    },
}

impl NeighbourList {
    const COMPLETE: u8 = 0;
    const INCREMENTAL: u8 = 1;

    pub fn version(&self) -> u8 {
        match self {
            NeighbourList::Complete { version, .. } => *version,
            NeighbourList::Incremental { version, .. } => *version,
        }
    }

    /// Body of a send-neighbours command
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            NeighbourList::Complete { version, entries } => {
                body.push(Self::COMPLETE);
                body.push(*version);
                encode_entries(&mut body, entries);
            }
            NeighbourList::Incremental {
                version,
                base_version,
                added,
                removed,
            } => {
                body.push(Self::INCREMENTAL);
                body.push(*version);
                body.push(*base_version);
                body.push(added.len() as u8);
                encode_entries(&mut body, added);
                encode_entries(&mut body, removed);
            }
        }
        body
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [Self::COMPLETE, version, rest @ ..] => Ok(NeighbourList::Complete {
                version: *version,
                entries: parse_entries(rest)?,
            }),
            [Self::INCREMENTAL, version, base_version, added_count, rest @ ..] => {
                let split = *added_count as usize * 2;
                if split > rest.len() {
                    return Err(ProtocolError::Malformed("added count exceeds body".into()));
                }
                Ok(NeighbourList::Incremental {
                    version: *version,
                    base_version: *base_version,
                    added: parse_entries(&rest[..split])?,
                    removed: parse_entries(&rest[split..])?,
                })
            }
            [] | [_] => Err(ProtocolError::BufferTooShort {
                need: 2,
                got: payload.len(),
            }),
            [other, ..] => Err(ProtocolError::Malformed(format!(
                "unknown neighbour list type {}",
                other
            ))),
        }
    }

    /// Body of a get-neighbours acknowledgement
    pub fn encode_ack(version: u8, entries: &[NeighbourEntry]) -> Vec<u8> {
        let mut body = vec![version];
        encode_entries(&mut body, entries);
        body
    }

    pub fn parse_ack(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.split_first() {
            Some((version, rest)) => Ok(NeighbourList::Complete {
                version: *version,
                entries: parse_entries(rest)?,
            }),
            None => Err(ProtocolError::BufferTooShort { need: 1, got: 0 }),
        }
    }
}

/// Encode a PakBus time stamp (seconds since 1990, nanoseconds)
pub fn encode_nsec(seconds: u32, nanos: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&seconds.to_be_bytes());
    out[4..].copy_from_slice(&nanos.to_be_bytes());
    out
}

pub fn decode_nsec(bytes: &[u8]) -> Result<(u32, u32), ProtocolError> {
    if bytes.len() < 8 {
        return Err(ProtocolError::BufferTooShort {
            need: 8,
            got: bytes.len(),
        });
    }
    Ok((
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
    ))
}

/// Format `name=value;` pairs as a NUL terminated settings string
pub fn format_settings(settings: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in settings {
        out.extend_from_slice(name.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(b';');
    }
    out.push(0);
    out
}

/// Format a `name;name;` request list
pub fn format_setting_names(names: &[String]) -> Vec<u8> {
    let mut out = names.join(";").into_bytes();
    out.push(0);
    out
}

fn ascii_z(bytes: &[u8]) -> Result<&str, ProtocolError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map_err(|_| ProtocolError::Malformed("settings are not valid text".into()))
}

/// Parse a `name=value;name=value;` settings string
pub fn parse_settings(bytes: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    ascii_z(bytes)?
        .split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((name, value)) => Ok((name.trim().to_string(), value.trim().to_string())),
            None => Err(ProtocolError::Malformed(format!("setting without value: {}", item))),
        })
        .collect()
}

/// Parse a `name;name;` request list
pub fn parse_setting_names(bytes: &[u8]) -> Result<Vec<String>, ProtocolError> {
    Ok(ascii_z(bytes)?
        .split(';')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::types::ProtocolType;

    #[test]
    fn test_failure_code_table() {
        for raw in 1..=13u8 {
            assert_eq!(FailureCode::from_u8(raw).as_u8(), raw);
        }
        assert_eq!(FailureCode::from_u8(3), FailureCode::TimedOutOrResourceError);
        assert_eq!(FailureCode::from_u8(13), FailureCode::EncryptionRequired);
        assert_eq!(FailureCode::from_u8(99), FailureCode::Unknown(99));
        assert!(FailureCode::PacketTooBig90.is_packet_too_big());
    }

    #[test]
    fn test_delivery_failure_quotes_failed_header() {
        let mut failed = Message::pakctrl(message_types::ECHO_CMD, 17, &[0; 40]);
        failed.source = 1;
        failed.destination = 33;
        let body = delivery_failure_body(FailureCode::UnreachableDestination, &failed);
        assert_eq!(body.len(), 17);

        let parsed = DeliveryFailure::parse(&body).unwrap();
        assert_eq!(parsed.code, FailureCode::UnreachableDestination);
        assert_eq!(parsed.failed.destination, 33);
        assert_eq!(parsed.failed.protocol, ProtocolType::Control);
        assert_eq!(parsed.failed.transaction_no(), Some(17));
    }

    #[test]
    fn test_neighbour_entry_packing() {
        let entry = NeighbourEntry {
            address: 0x0abc,
            is_router: true,
            hop_metric: HopMetric::from_code(5),
        };
        assert_eq!(entry.pack(), 0xdabc);
        assert_eq!(NeighbourEntry::unpack(0xdabc), entry);
    }

    #[test]
    fn test_incremental_list_layout() {
        let added = NeighbourEntry {
            address: 7,
            is_router: false,
            hop_metric: HopMetric::from_code(1),
        };
        let removed = NeighbourEntry {
            address: 9,
            is_router: true,
            hop_metric: HopMetric::from_code(0),
        };
        let list = NeighbourList::Incremental {
            version: 4,
            base_version: 3,
            added: vec![added],
            removed: vec![removed],
        };
        let body = list.encode();
        assert_eq!(body, vec![1, 4, 3, 1, 0x10, 0x07, 0x80, 0x09]);
        assert_eq!(NeighbourList::parse(&body).unwrap(), list);
    }

    #[test]
    fn test_neighbour_list_rejects_bad_counts() {
        assert!(NeighbourList::parse(&[1, 4, 3, 5, 0, 1]).is_err());
        assert!(NeighbourList::parse(&[0, 4, 1]).is_err());
        assert!(NeighbourList::parse(&[9, 1]).is_err());
        assert!(NeighbourList::parse(&[0]).is_err());
    }

    #[test]
    fn test_hello_info_layout() {
        let info = HelloInfo {
            is_router: true,
            hop_metric: HopMetric::from_code(2),
            verify_interval: 300,
        };
        assert_eq!(info.encode(), vec![1, 2, 0x01, 0x2c]);
        assert_eq!(HelloInfo::parse(&info.encode()).unwrap(), info);
        assert!(HelloInfo::parse(&[1, 2]).is_err());
    }

    #[test]
    fn test_settings_string() {
        let settings = vec![
            ("PakBusAddress".to_string(), "1".to_string()),
            ("Beacon".to_string(), "60".to_string()),
        ];
        let encoded = format_settings(&settings);
        assert_eq!(encoded, b"PakBusAddress=1;Beacon=60;\0".to_vec());
        assert_eq!(parse_settings(&encoded).unwrap(), settings);
        assert!(parse_settings(b"broken;\0").is_err());
    }

    #[test]
    fn test_setting_names() {
        let names = vec!["A".to_string(), "B".to_string()];
        let encoded = format_setting_names(&names);
        assert_eq!(encoded, b"A;B\0".to_vec());
        assert_eq!(parse_setting_names(&encoded).unwrap(), names);
    }

    #[test]
    fn test_nsec_layout() {
        let bytes = encode_nsec(0x01020304, 500);
        assert_eq!(decode_nsec(&bytes).unwrap(), (0x01020304, 500));
        assert!(decode_nsec(&bytes[..7]).is_err());
    }
}
