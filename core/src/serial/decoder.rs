// Stateful frame decoder and frame encoder

use tracing::{debug, warn};

use super::quote::{decode_quoted_data, encode_quoted_data, DecodeOutcome, SYNCH_BYTE};
use crate::message::codec::{append_sig_nullifier, calc_sig, SIG_SEED};

/// Length of the signature nullifier trailing each frame
const NULLIFIER_LEN: usize = 2;

/// Something the decoder recognised in the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete packet with the nullifier stripped
    Packet(Vec<u8>),
    /// A delimited frame whose signature did not check
    BadSignature,
    QuoteError,
    PacketTooLong,
}

/// Wrap `packet` for a serial link
pub fn encode_frame(packet: &[u8]) -> Vec<u8> {
    let mut signed = packet.to_vec();
    append_sig_nullifier(&mut signed);

    let mut frame = Vec::with_capacity(signed.len() + signed.len() / 8 + 2);
    frame.push(SYNCH_BYTE);
    encode_quoted_data(&mut frame, &signed);
    frame.push(SYNCH_BYTE);
    frame
}

/// Turns a raw serial stream into packets, resuming across reads.
#[derive(Debug, Default)]
pub struct SerialDecoder {
    buffer: Vec<u8>,
    unquote_next: bool,
    synched: bool,
}

impl SerialDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any partially received frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.unquote_next = false;
        self.synched = false;
    }

    /// Feed bytes read from the link and collect everything they complete
    pub fn feed(&mut self, mut input: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        while !input.is_empty() {
            if !self.synched {
                match input.iter().position(|&b| b == SYNCH_BYTE) {
                    Some(pos) => {
                        self.synched = true;
                        input = &input[pos + 1..];
                        continue;
                    }
                    None => break,
                }
            }

            let (consumed, outcome) =
                decode_quoted_data(&mut self.buffer, &mut self.unquote_next, input);
            input = &input[consumed..];
            match outcome {
                DecodeOutcome::SynchNotFound => {}
                DecodeOutcome::SynchFound => {
                    // back-to-back synch bytes carry nothing
                    if !self.buffer.is_empty() {
                        let frame = std::mem::take(&mut self.buffer);
                        events.push(Self::check_frame(frame));
                    }
                }
                DecodeOutcome::QuoteError => {
                    warn!("Serial quote error, frame discarded");
                    self.synched = false;
                    events.push(FrameEvent::QuoteError);
                }
                DecodeOutcome::PacketTooLong => {
                    warn!("Serial frame too long, discarded");
                    self.synched = false;
                    events.push(FrameEvent::PacketTooLong);
                }
            }
        }
        events
    }

    fn check_frame(mut frame: Vec<u8>) -> FrameEvent {
        if frame.len() <= NULLIFIER_LEN || calc_sig(&frame, SIG_SEED) != 0 {
            debug!("Serial frame of {} bytes failed signature check", frame.len());
            return FrameEvent::BadSignature;
        }
        frame.truncate(frame.len() - NULLIFIER_LEN);
        FrameEvent::Packet(frame)
    }
}
