// Encryption envelope
//
// Body of an encrypted message:
//   [0]    flags: original protocol (4) | cipher code (4)
//   [1..3] plaintext length
//   [3..5] plaintext signature
//   [5..21] random salt
//   [21..]  ciphertext
//
// Length and signature byte order is a per-network setting. The IV hashes
// the header bytes that do not change hop to hop, the clear part of the
// envelope and the salt, so every sealing gets a fresh IV and a rewritten
// header fails to decrypt.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{Cipher, CryptoError};
use crate::message::codec::{encode_header, HEADER_LEN};
use crate::message::{calc_sig, Message, ProtocolType, SIG_SEED};

/// Flags, length and signature
const CLEAR_LEN: usize = 5;

/// Random bytes carried with every envelope
pub const SALT_LEN: usize = 16;

/// Bytes preceding the ciphertext
pub const ENVELOPE_HEADER_LEN: usize = CLEAR_LEN + SALT_LEN;

const IV_CONTEXT: &[u8] = b"pakbus envelope iv";

/// Long enough for an extended nonce
pub const IV_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl EnvelopeByteOrder {
    fn write_u16(self, value: u16) -> [u8; 2] {
        match self {
            EnvelopeByteOrder::BigEndian => value.to_be_bytes(),
            EnvelopeByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }

    fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            EnvelopeByteOrder::BigEndian => u16::from_be_bytes(bytes),
            EnvelopeByteOrder::LittleEndian => u16::from_le_bytes(bytes),
        }
    }
}

/// Cipher code named by an envelope, if the body is long enough to hold one
pub fn envelope_cipher_code(body: &[u8]) -> Option<u8> {
    body.first().map(|flags| flags & 0x0f)
}

/// `clear` is the envelope up to and including the salt
fn envelope_iv(header: &[u8; HEADER_LEN], clear: &[u8]) -> [u8; IV_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(IV_CONTEXT);
    // protocol, destination, source; the hop count nibble changes in transit
    hasher.update(&[header[4], header[5], header[6] & 0x0f, header[7]]);
    hasher.update(clear);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&hasher.finalize().as_bytes()[..IV_LEN]);
    iv
}

/// Wrap `msg` in an encryption envelope
pub fn seal_envelope(
    cipher: &dyn Cipher,
    byte_order: EnvelopeByteOrder,
    msg: &Message,
) -> Result<Message, CryptoError> {
    let plaintext_len = u16::try_from(msg.body.len())
        .map_err(|_| CryptoError::EncryptionFailed("payload too large".into()))?;
    let mut clear = Vec::with_capacity(ENVELOPE_HEADER_LEN + msg.body.len() + 16);
    clear.push((msg.protocol.as_u8() << 4) | (cipher.cipher_code() & 0x0f));
    clear.extend_from_slice(&byte_order.write_u16(plaintext_len));
    clear.extend_from_slice(&byte_order.write_u16(calc_sig(&msg.body, SIG_SEED)));
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    clear.extend_from_slice(&salt);

    let mut sealed = msg.clone();
    sealed.protocol = ProtocolType::Encrypted;
    let iv = envelope_iv(&encode_header(&sealed), &clear);
    let ciphertext = cipher.encrypt(&iv, &msg.body)?;

    clear.extend_from_slice(&ciphertext);
    sealed.body = clear;
    Ok(sealed)
}

/// Unwrap an encrypted message, verifying length and signature of the result
pub fn open_envelope(
    cipher: &dyn Cipher,
    byte_order: EnvelopeByteOrder,
    msg: &Message,
) -> Result<Message, CryptoError> {
    if msg.body.len() < ENVELOPE_HEADER_LEN {
        return Err(CryptoError::EnvelopeTooShort {
            need: ENVELOPE_HEADER_LEN,
            got: msg.body.len(),
        });
    }
    let flags = msg.body[0];
    if flags & 0x0f != cipher.cipher_code() & 0x0f {
        return Err(CryptoError::UnsupportedCipher(flags & 0x0f));
    }
    let protocol = ProtocolType::from_u8(flags >> 4)?;
    let expected_len = byte_order.read_u16([msg.body[1], msg.body[2]]) as usize;
    let expected_sig = byte_order.read_u16([msg.body[3], msg.body[4]]);

    let iv = envelope_iv(&encode_header(msg), &msg.body[..ENVELOPE_HEADER_LEN]);
    let plaintext = cipher.decrypt(&iv, &msg.body[ENVELOPE_HEADER_LEN..])?;
    if plaintext.len() != expected_len {
        return Err(CryptoError::LengthMismatch {
            expected: expected_len,
            got: plaintext.len(),
        });
    }
    if calc_sig(&plaintext, SIG_SEED) != expected_sig {
        return Err(CryptoError::SignatureMismatch);
    }

    let mut opened = msg.clone();
    opened.protocol = protocol;
    opened.body = plaintext;
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChaChaCipher;

    struct OtherCipher;

    impl Cipher for OtherCipher {
        fn cipher_code(&self) -> u8 {
            9
        }
        fn encrypt(&self, _iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(plaintext.to_vec())
        }
        fn decrypt(&self, _iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(ciphertext.to_vec())
        }
    }

    fn sample() -> Message {
        let mut msg = Message::bmp5(0x17, 4, b"collect table one").with_destination(2);
        msg.source = 1;
        msg
    }

    #[test]
    fn test_seal_then_open() {
        let cipher = ChaChaCipher::from_passphrase("secret");
        let sealed = seal_envelope(&cipher, EnvelopeByteOrder::BigEndian, &sample()).unwrap();
        assert_eq!(sealed.protocol, ProtocolType::Encrypted);
        assert_eq!(sealed.body[0], 0x10 | CHACHA_CODE);
        assert_eq!(&sealed.body[1..3], &[0, 19]);

        let opened = open_envelope(&cipher, EnvelopeByteOrder::BigEndian, &sealed).unwrap();
        assert_eq!(opened, sample());
    }

    const CHACHA_CODE: u8 = crate::crypto::XCHACHA20_POLY1305_CODE;

    #[test]
    fn test_little_endian_lengths() {
        let cipher = ChaChaCipher::from_passphrase("secret");
        let sealed = seal_envelope(&cipher, EnvelopeByteOrder::LittleEndian, &sample()).unwrap();
        assert_eq!(&sealed.body[1..3], &[19, 0]);
        assert!(open_envelope(&cipher, EnvelopeByteOrder::LittleEndian, &sealed).is_ok());
    }

    #[test]
    fn test_hop_count_does_not_change_iv() {
        let cipher = ChaChaCipher::from_passphrase("secret");
        let mut sealed = seal_envelope(&cipher, EnvelopeByteOrder::BigEndian, &sample()).unwrap();
        sealed.hop_count = 4;
        sealed.physical_destination = 77;
        assert!(open_envelope(&cipher, EnvelopeByteOrder::BigEndian, &sealed).is_ok());
    }

    #[test]
    fn test_equal_plaintexts_seal_differently() {
        let cipher = ChaChaCipher::from_passphrase("secret");
        let first = seal_envelope(&cipher, EnvelopeByteOrder::BigEndian, &sample()).unwrap();
        let second = seal_envelope(&cipher, EnvelopeByteOrder::BigEndian, &sample()).unwrap();
        let salt = CLEAR_LEN..ENVELOPE_HEADER_LEN;
        assert_ne!(&first.body[salt.clone()], &second.body[salt]);
        assert_ne!(&first.body[ENVELOPE_HEADER_LEN..], &second.body[ENVELOPE_HEADER_LEN..]);
        assert_eq!(open_envelope(&cipher, EnvelopeByteOrder::BigEndian, &second).unwrap(), sample());
    }

    #[test]
    fn test_rewritten_header_or_salt_fails() {
        let cipher = ChaChaCipher::from_passphrase("secret");
        let sealed = seal_envelope(&cipher, EnvelopeByteOrder::BigEndian, &sample()).unwrap();

        let mut redirected = sealed.clone();
        redirected.destination = 3;
        assert!(matches!(
            open_envelope(&cipher, EnvelopeByteOrder::BigEndian, &redirected),
            Err(CryptoError::DecryptionFailed(_))
        ));

        let mut salted = sealed;
        salted.body[CLEAR_LEN] ^= 0x01;
        assert!(matches!(
            open_envelope(&cipher, EnvelopeByteOrder::BigEndian, &salted),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_cipher_code_mismatch() {
        let sealed = seal_envelope(&OtherCipher, EnvelopeByteOrder::BigEndian, &sample()).unwrap();
        assert_eq!(envelope_cipher_code(&sealed.body), Some(9));
        let cipher = ChaChaCipher::from_passphrase("secret");
        assert_eq!(
            open_envelope(&cipher, EnvelopeByteOrder::BigEndian, &sealed),
            Err(CryptoError::UnsupportedCipher(9))
        );
    }

    #[test]
    fn test_tampered_length_detected() {
        let mut sealed = seal_envelope(&OtherCipher, EnvelopeByteOrder::BigEndian, &sample()).unwrap();
        sealed.body[2] += 1;
        assert!(matches!(
            open_envelope(&OtherCipher, EnvelopeByteOrder::BigEndian, &sealed),
            Err(CryptoError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_tampered_signature_detected() {
        let mut sealed = seal_envelope(&OtherCipher, EnvelopeByteOrder::BigEndian, &sample()).unwrap();
        sealed.body[4] ^= 0xff;
        assert_eq!(
            open_envelope(&OtherCipher, EnvelopeByteOrder::BigEndian, &sealed),
            Err(CryptoError::SignatureMismatch)
        );
    }

    #[test]
    fn test_short_envelope() {
        let mut msg = sample();
        msg.protocol = ProtocolType::Encrypted;
        msg.body = vec![0x11, 0];
        assert!(matches!(
            open_envelope(&OtherCipher, EnvelopeByteOrder::BigEndian, &msg),
            Err(CryptoError::EnvelopeTooShort { need: ENVELOPE_HEADER_LEN, got: 2 })
        ));
    }
}
