//! At-rest encryption for stored blobs
//!
//! AES-256-GCM with a random 96-bit nonce per blob. The stored form is
//! `nonce || ciphertext`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Invalid key: expected 32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed (wrong key or corrupted data): {0}")]
    Decryption(String),

    #[error("Encrypted blob too short: {0} bytes")]
    Truncated(usize),
}

/// Symmetric cipher for blob contents
#[derive(Clone)]
pub struct BlobCipher {
    cipher: Aes256Gcm,
}

impl BlobCipher {
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, CipherError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CipherError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    pub fn decrypt(&self, combined: &[u8]) -> Result<Vec<u8>, CipherError> {
        if combined.len() < NONCE_SIZE {
            return Err(CipherError::Truncated(combined.len()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CipherError::Decryption(e.to_string()))
    }
}

impl std::fmt::Debug for BlobCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlobCipher(..)")
    }
}
