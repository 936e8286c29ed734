// Cryptography module — pluggable payload ciphers and the PakBus encryption envelope

pub mod cipher;
pub mod envelope;

pub use cipher::{ChaChaCipher, Cipher, CipherRegistry, XCHACHA20_POLY1305_CODE};
pub use envelope::{
    envelope_cipher_code, open_envelope, seal_envelope, EnvelopeByteOrder, ENVELOPE_HEADER_LEN,
};

use thiserror::Error;

use crate::message::ProtocolError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Envelope too short: need {need} bytes, got {got}")]
    EnvelopeTooShort { need: usize, got: usize },

    #[error("No cipher with code {0}")]
    UnsupportedCipher(u8),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Decrypted length {got} does not match envelope length {expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Decrypted payload signature mismatch")]
    SignatureMismatch,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
