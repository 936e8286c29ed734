// Byte quoting codec

/// Packet delimiter
pub const SYNCH_BYTE: u8 = 0xbd;

/// Escape prefix
pub const QUOTE_BYTE: u8 = 0xbc;

/// Offset added to an escaped byte
const QUOTE_OFFSET: u8 = 0x20;

/// Longest unquoted packet accepted by the decoder
pub const MAX_PACKET_LEN: usize = 1024;

/// Why `decode_quoted_data` stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A synch byte ended the packet; it was consumed
    SynchFound,
    /// All input was consumed without reaching a synch byte
    SynchNotFound,
    /// A quote byte was followed by something other than a quoted form.
    /// The accumulator has been cleared.
    QuoteError,
    /// The accumulator grew beyond `MAX_PACKET_LEN`. It has been cleared.
    PacketTooLong,
}

/// Unquote `source` into `dest` until a synch byte or the end of input.
///
/// `unquote_next` carries a trailing quote byte over to the next call, so a
/// packet may be fed across any number of reads. Returns the number of
/// source bytes consumed; the caller resumes from there.
pub fn decode_quoted_data(
    dest: &mut Vec<u8>,
    unquote_next: &mut bool,
    source: &[u8],
) -> (usize, DecodeOutcome) {
    for (i, &byte) in source.iter().enumerate() {
        if *unquote_next {
            *unquote_next = false;
            if byte == QUOTE_BYTE + QUOTE_OFFSET || byte == SYNCH_BYTE + QUOTE_OFFSET {
                dest.push(byte - QUOTE_OFFSET);
            } else {
                dest.clear();
                // a synch after a quote still delimits the next packet
                let consumed = if byte == SYNCH_BYTE { i } else { i + 1 };
                return (consumed, DecodeOutcome::QuoteError);
            }
        } else if byte == QUOTE_BYTE {
            *unquote_next = true;
        } else if byte == SYNCH_BYTE {
            return (i + 1, DecodeOutcome::SynchFound);
        } else {
            dest.push(byte);
        }

        if dest.len() > MAX_PACKET_LEN {
            dest.clear();
            *unquote_next = false;
            return (i + 1, DecodeOutcome::PacketTooLong);
        }
    }
    (source.len(), DecodeOutcome::SynchNotFound)
}

/// Quote `source` onto the end of `dest`
pub fn encode_quoted_data(dest: &mut Vec<u8>, source: &[u8]) {
    dest.reserve(source.len());
    for &byte in source {
        if byte == SYNCH_BYTE || byte == QUOTE_BYTE {
            dest.push(QUOTE_BYTE);
            dest.push(byte + QUOTE_OFFSET);
        } else {
            dest.push(byte);
        }
    }
}
