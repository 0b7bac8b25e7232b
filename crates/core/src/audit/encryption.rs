//! AES-256-GCM record encryption for the `standard` and `high` levels.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};

/// Cipher applied to audit record fields before they are enqueued.
pub struct RecordCipher {
    cipher: Aes256Gcm,
}

impl RecordCipher {
    /// Key must be exactly 32 bytes.
    pub fn new(key: &str) -> Result<Self> {
        let key_bytes = key.as_bytes();
        if key_bytes.len() != 32 {
            return Err(Error::invalid("audit encryption key must be exactly 32 bytes"));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::permanent(format!("audit encryption failed: {}", e)))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt_string(&self, encoded: &str) -> Result<String> {
        let combined = STANDARD
            .decode(encoded)
            .map_err(|e| Error::invalid(format!("invalid base64 ciphertext: {}", e)))?;
        if combined.len() < 12 {
            return Err(Error::invalid("ciphertext shorter than nonce"));
        }
        let (nonce_bytes, encrypted) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, encrypted)
            .map_err(|e| Error::permanent(format!("audit decryption failed: {}", e)))?;
        String::from_utf8(plaintext).map_err(|e| Error::invalid(format!("invalid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn round_trip() {
        let cipher = RecordCipher::new(KEY).unwrap();
        let encrypted = cipher.encrypt_string("{\"amount\":\"9500\"}").unwrap();
        assert_ne!(encrypted, "{\"amount\":\"9500\"}");
        assert_eq!(cipher.decrypt_string(&encrypted).unwrap(), "{\"amount\":\"9500\"}");
    }

    #[test]
    fn rejects_short_key() {
        assert!(RecordCipher::new("too-short").is_err());
    }

    #[test]
    fn nonce_differs_per_encryption() {
        let cipher = RecordCipher::new(KEY).unwrap();
        let a = cipher.encrypt_string("x").unwrap();
        let b = cipher.encrypt_string("x").unwrap();
        assert_ne!(a, b);
    }
}
