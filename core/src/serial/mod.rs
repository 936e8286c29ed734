//! Serial framing — byte quoting and packet delimiting for serial links
//!
//! A serial packet travels as `SYNCH, quoted(packet + nullifier), SYNCH`.
//! Quoting replaces every synch or quote byte inside the packet with the
//! quote byte followed by the original plus 0x20, so the synch byte only
//! ever appears as a delimiter. The two nullifier bytes make the CSI
//! signature of the whole unquoted run equal zero.

pub mod decoder;
pub mod quote;

pub use decoder::{encode_frame, FrameEvent, SerialDecoder};
pub use quote::{
    decode_quoted_data, encode_quoted_data, DecodeOutcome, MAX_PACKET_LEN, QUOTE_BYTE, SYNCH_BYTE,
};
