//! Token encryption — AES-256-GCM envelope cipher for OAuth tokens at rest.
//!
//! The cipher key is derived from the process encryption secret via SHA-256,
//! so operators configure a passphrase rather than raw key bytes. Ciphertext
//! is nonce-prefixed and base64-encoded for storage in text columns.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::CredentialError;

/// Encrypts and decrypts connector tokens.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Derive a cipher from the configured process secret.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key: [u8; 32] = digest.into();
        Self::from_key(&key)
    }

    /// Create a cipher from a raw 32-byte key.
    pub fn from_key(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key is always valid");
        Self { cipher }
    }

    /// Encrypt a token. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::EncryptFailed {
                message: e.to_string(),
            })?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a token produced by `encrypt()`.
    pub fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| CredentialError::DecryptFailed {
                message: format!("base64 decode error: {e}"),
            })?;
        if blob.len() < 12 {
            return Err(CredentialError::DecryptFailed {
                message: "data too short to contain nonce".to_string(),
            });
        }

        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext =
            self.cipher
                .decrypt(nonce, ciphertext)
                .map_err(|e| CredentialError::DecryptFailed {
                    message: e.to_string(),
                })?;
        String::from_utf8(plaintext).map_err(|e| CredentialError::DecryptFailed {
            message: format!("invalid utf-8 in plaintext: {e}"),
        })
    }
}
