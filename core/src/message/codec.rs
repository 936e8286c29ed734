// Message codec — the common PakBus header and the signature algorithm
//
// Header layout (8 bytes, most significant nibble first):
//   [0] link state (4) | physical destination high nibble
//   [1] physical destination low byte
//   [2] expect more (2) | priority (2) | physical source high nibble
//   [3] physical source low byte
//   [4] protocol (4) | destination node high nibble
//   [5] destination node low byte
//   [6] hop count (4) | source node high nibble
//   [7] source node low byte

use super::types::{ExpectMore, Message, NodeAddress, Priority, ProtocolType};
use super::ProtocolError;

/// Length of the common header
pub const HEADER_LEN: usize = 8;

/// Link state: link stays up after this packet
pub const LINK_READY: u8 = 0x09;

/// Link state: sender is closing the link after this packet
pub const LINK_FINISHED: u8 = 0x0a;

/// Seed for the CSI signature algorithm
pub const SIG_SEED: u16 = 0xaaaa;

fn split_address(high_nibble: u8, address: NodeAddress) -> [u8; 2] {
    [
        (high_nibble << 4) | ((address >> 8) as u8 & 0x0f),
        (address & 0xff) as u8,
    ]
}

fn join_address(bytes: &[u8]) -> NodeAddress {
    (((bytes[0] & 0x0f) as NodeAddress) << 8) | bytes[1] as NodeAddress
}

/// Encode the common header for `msg`
pub fn encode_header(msg: &Message) -> [u8; HEADER_LEN] {
    let link_state = if msg.will_close { LINK_FINISHED } else { LINK_READY };
    let control = (msg.expect_more.as_u8() << 2) | msg.priority.as_u8();
    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&split_address(link_state, msg.physical_destination));
    header[2..4].copy_from_slice(&split_address(control, msg.physical_source));
    header[4..6].copy_from_slice(&split_address(msg.protocol.as_u8(), msg.destination));
    header[6..8].copy_from_slice(&split_address(msg.hop_count & 0x0f, msg.source));
    header
}

impl Message {
    /// Serialize header and body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&encode_header(self));
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parse a packet as delivered by a port
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::BufferTooShort {
                need: HEADER_LEN,
                got: data.len(),
            });
        }
        let protocol = ProtocolType::from_u8(data[4] >> 4)?;
        let mut msg = Message::new(protocol, data[HEADER_LEN..].to_vec());
        msg.will_close = (data[0] >> 4) == LINK_FINISHED;
        msg.physical_destination = join_address(&data[0..2]);
        msg.expect_more = ExpectMore::from_u8(data[2] >> 6);
        msg.priority = Priority::from_u8(data[2] >> 4);
        msg.physical_source = join_address(&data[2..4]);
        msg.destination = join_address(&data[4..6]);
        msg.hop_count = data[6] >> 4;
        msg.source = join_address(&data[6..8]);
        if protocol.has_transaction_header() && msg.body.len() < 2 {
            return Err(ProtocolError::BufferTooShort {
                need: HEADER_LEN + 2,
                got: data.len(),
            });
        }
        Ok(msg)
    }
}

/// CSI signature of `data`, continuing from `seed`
pub fn calc_sig(data: &[u8], seed: u16) -> u16 {
    data.iter().fold(seed, |sig, &byte| {
        let j = sig;
        let mut rtn = (sig << 1) & 0x01ff;
        if rtn >= 0x100 {
            rtn += 1;
        }
        ((rtn.wrapping_add(j >> 8).wrapping_add(byte as u16)) & 0xff) | (j << 8)
    })
}

/// Two bytes that, appended to data whose signature is `sig`, make the
/// signature of the whole run equal zero.
pub fn calc_sig_nullifier(sig: u16) -> [u8; 2] {
    let null0 = nullifier_byte(sig);
    let after_first = calc_sig(&[null0], sig);
    let null1 = nullifier_byte(after_first);
    [null0, null1]
}

fn nullifier_byte(sig: u16) -> u8 {
    let mut new_seed = (sig << 1) & 0x01ff;
    if new_seed >= 0x100 {
        new_seed += 1;
    }
    (0x100u16.wrapping_sub(new_seed.wrapping_add(sig >> 8)) & 0xff) as u8
}

/// Append the nullifier so that `calc_sig(data, SIG_SEED) == 0`
pub fn append_sig_nullifier(data: &mut Vec<u8>) {
    let nullifier = calc_sig_nullifier(calc_sig(data, SIG_SEED));
    data.extend_from_slice(&nullifier);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut msg = Message::pakctrl(0x09, 0x21, &[1, 0, 0x3c]);
        msg.source = 0x123;
        msg.destination = 0xabc;
        msg.physical_source = 0x123;
        msg.physical_destination = 0x0fe;
        msg.hop_count = 3;
        msg.priority = Priority::High;
        msg.expect_more = ExpectMore::Reverse;
        msg
    }

    #[test]
    fn test_header_bit_layout() {
        let header = encode_header(&sample());
        assert_eq!(header, [0x90, 0xfe, 0xe1, 0x23, 0x0a, 0xbc, 0x31, 0x23]);
    }

    #[test]
    fn test_will_close_sets_link_state() {
        let mut msg = sample();
        msg.will_close = true;
        assert_eq!(encode_header(&msg)[0] >> 4, LINK_FINISHED);
        let parsed = Message::from_bytes(&msg.to_bytes()).unwrap();
        assert!(parsed.will_close);
    }

    #[test]
    fn test_parse_restores_fields() {
        let original = sample();
        let parsed = Message::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed.source, 0x123);
        assert_eq!(parsed.destination, 0xabc);
        assert_eq!(parsed.physical_destination, 0x0fe);
        assert_eq!(parsed.hop_count, 3);
        assert_eq!(parsed.priority, Priority::High);
        assert_eq!(parsed.expect_more, ExpectMore::Reverse);
        assert_eq!(parsed.body, original.body);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(matches!(
            Message::from_bytes(&[0x90, 0x01, 0x00]),
            Err(ProtocolError::BufferTooShort { need: 8, got: 3 })
        ));
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[4] = 0x7a;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(ProtocolError::InvalidProtocol(7))
        ));
    }

    #[test]
    fn test_control_without_transaction_header_rejected() {
        let mut bytes = sample().to_bytes();
        bytes.truncate(HEADER_LEN + 1);
        assert!(Message::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_nullifier_zeroes_signature() {
        for data in [&b""[..], b"a", b"PakBus echo padding", &[0xff; 37]] {
            let mut buf = data.to_vec();
            append_sig_nullifier(&mut buf);
            assert_eq!(calc_sig(&buf, SIG_SEED), 0, "data {:?}", data);
        }
    }

    #[test]
    fn test_signature_detects_corruption() {
        let mut buf = b"some padding bytes".to_vec();
        append_sig_nullifier(&mut buf);
        buf[3] ^= 0x01;
        assert_ne!(calc_sig(&buf, SIG_SEED), 0);
    }
}
