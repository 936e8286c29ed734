// Payload ciphers: XChaCha20-Poly1305 keyed from a shared passphrase
//
// Flow:
// 1. Key: Blake3::derive_key(context, passphrase) → 32-byte key
// 2. Nonce: the 24 byte IV the envelope derives from header and salt
// 3. Encrypt: XChaCha20-Poly1305(key, nonce, plaintext)

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;
use crate::message::{NodeAddress, BROADCAST_ADDRESS};

/// KDF context for passphrase keys. Changing this breaks every deployed link.
const KDF_CONTEXT: &str = "pakbus-router payload cipher 2026-10-01";

/// Cipher code carried in the low nibble of the envelope flags
pub const XCHACHA20_POLY1305_CODE: u8 = 1;

const NONCE_LEN: usize = 24;

/// A symmetric cipher the router can wrap payloads with
pub trait Cipher: Send + Sync {
    /// Four bit code identifying the algorithm on the wire
    fn cipher_code(&self) -> u8;

    fn encrypt(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// XChaCha20-Poly1305 with a passphrase derived key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChaChaCipher {
    key: [u8; 32],
}

impl ChaChaCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            key: blake3::derive_key(KDF_CONTEXT, passphrase.as_bytes()),
        }
    }

    fn nonce(iv: &[u8]) -> Result<&XNonce, CryptoError> {
        if iv.len() < NONCE_LEN {
            return Err(CryptoError::EncryptionFailed(format!(
                "IV of {} bytes is shorter than the nonce",
                iv.len()
            )));
        }
        Ok(XNonce::from_slice(&iv[..NONCE_LEN]))
    }
}

impl fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaCipher").finish_non_exhaustive()
    }
}

impl Cipher for ChaChaCipher {
    fn cipher_code(&self) -> u8 {
        XCHACHA20_POLY1305_CODE
    }

    fn encrypt(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        cipher
            .encrypt(Self::nonce(iv)?, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        cipher
            .decrypt(Self::nonce(iv)?, ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// Ciphers by peer address. The broadcast address holds the default.
#[derive(Clone, Default)]
pub struct CipherRegistry {
    ciphers: HashMap<NodeAddress, Arc<dyn Cipher>>,
}

impl CipherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, address: NodeAddress, cipher: Arc<dyn Cipher>) {
        self.ciphers.insert(address, cipher);
    }

    pub fn remove(&mut self, address: NodeAddress) -> bool {
        self.ciphers.remove(&address).is_some()
    }

    /// Cipher for `address`, falling back to the default slot
    pub fn for_address(&self, address: NodeAddress) -> Option<Arc<dyn Cipher>> {
        self.ciphers
            .get(&address)
            .or_else(|| self.ciphers.get(&BROADCAST_ADDRESS))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ciphers.len()
    }
}

impl fmt::Debug for CipherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut addresses: Vec<_> = self.ciphers.keys().copied().collect();
        addresses.sort_unstable();
        f.debug_struct("CipherRegistry")
            .field("addresses", &addresses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = ChaChaCipher::from_passphrase("station secret");
        let iv = [7u8; NONCE_LEN];
        let ciphertext = cipher.encrypt(&iv, b"table data").unwrap();
        assert_ne!(&ciphertext[..10], b"table data");
        assert_eq!(cipher.decrypt(&iv, &ciphertext).unwrap(), b"table data");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let iv = [1u8; NONCE_LEN];
        let ciphertext = ChaChaCipher::from_passphrase("a").encrypt(&iv, b"x").unwrap();
        assert!(matches!(
            ChaChaCipher::from_passphrase("b").decrypt(&iv, &ciphertext),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_short_iv_rejected() {
        let cipher = ChaChaCipher::from_passphrase("a");
        assert!(cipher.encrypt(&[0u8; 12], b"x").is_err());
    }

    #[test]
    fn test_registry_falls_back_to_default_slot() {
        let mut registry = CipherRegistry::new();
        assert!(registry.for_address(5).is_none());
        registry.set(BROADCAST_ADDRESS, Arc::new(ChaChaCipher::from_passphrase("default")));
        assert!(registry.for_address(5).is_some());
        registry.set(6, Arc::new(ChaChaCipher::from_passphrase("six")));
        assert_eq!(registry.len(), 2);
        assert!(registry.remove(6));
        assert!(!registry.remove(6));
    }
}
