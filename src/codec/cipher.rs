//! AES-256-GCM encryption of envelope bodies.
//!
//! Peers sharing a secret derive the same 32-byte key with SHA-256. Each
//! body is sealed with a fresh random nonce.
//!
//! Encrypted format: `nonce (12 bytes) || ciphertext`
//!
//! Failures never include plaintext or key material.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{BusError, Result};

/// Nonce size for AES-256-GCM (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Symmetric cipher keyed by a shared secret.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    /// Derive the key from an arbitrary-length shared secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        let key: [u8; 32] = Sha256::digest(secret).into();
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Encrypt with a random nonce.
    ///
    /// Encrypting the same plaintext twice produces different output.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| BusError::Protocol("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt).
    ///
    /// A truncated body or a failed authentication tag is a malformed envelope.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(BusError::MalformedEnvelope(
                "ciphertext too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| BusError::MalformedEnvelope("decryption failed".to_string()))
    }
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PayloadCipher(AES-256-GCM)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = PayloadCipher::from_secret(b"shared-secret");
        let sealed = cipher.encrypt(b"payload").unwrap();

        assert_eq!(sealed.len(), NONCE_SIZE + b"payload".len() + 16);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let cipher = PayloadCipher::from_secret(b"k");
        assert_ne!(cipher.encrypt(b"same").unwrap(), cipher.encrypt(b"same").unwrap());
    }

    #[test]
    fn test_same_secret_interoperates() {
        let a = PayloadCipher::from_secret(b"fleet");
        let b = PayloadCipher::from_secret(b"fleet");
        assert_eq!(b.decrypt(&a.encrypt(b"hi").unwrap()).unwrap(), b"hi");
    }

    #[test]
    fn test_wrong_secret_is_malformed() {
        let sealed = PayloadCipher::from_secret(b"one").encrypt(b"hi").unwrap();
        let err = PayloadCipher::from_secret(b"two").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, BusError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_truncated_is_malformed() {
        let cipher = PayloadCipher::from_secret(b"k");
        let err = cipher.decrypt(&[0u8; 5]).unwrap_err();
        assert!(err.to_string().contains("too short"));
    }
}
