//! Decryption of encrypted column values
//!
//! Encrypted properties are stored by the host as opaque byte blobs. The
//! `Decrypt` property rule hands those bytes to an `AuditDecryption`
//! implementation so the audit record carries the readable value.

use crate::error::{AuditError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

/// Length of the SHA-256 prefix carried by hashed blobs
pub const HASH_LEN: usize = 32;

/// Length of the AES-GCM nonce carried by every blob
pub const NONCE_LEN: usize = 12;

/// Trait for decrypting encrypted property values
pub trait AuditDecryption: Send + Sync {
    /// Decrypt a stored blob
    ///
    /// `includes_hash` must match the value used when the blob was encrypted.
    /// A `None` input (null column) yields `None`.
    fn decrypt(&self, cipher_text: Option<&[u8]>, includes_hash: bool) -> Result<Option<String>>;
}

/// AES-256-GCM decryption with key rotation support
///
/// Blob layout: `[sha256(plaintext) when hashed] || nonce || ciphertext`.
/// Encrypts with the active key, decrypts with any registered key.
pub struct Aes256GcmDecryption {
    /// Active key ID for encryption
    active_key_id: String,

    /// All registered keys (key_id → cipher)
    keys: RwLock<HashMap<String, Aes256Gcm>>,
}

impl Aes256GcmDecryption {
    /// Create a new instance with a single key
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)));

        Self {
            active_key_id: key_id,
            keys: RwLock::new(keys),
        }
    }

    /// Add a key for decryption (key rotation)
    pub fn add_key(&self, key_id: impl Into<String>, key: &[u8; 32]) -> Result<()> {
        let mut keys = self.keys.write().map_err(|e| {
            AuditError::Config(format!("Failed to acquire key lock: {}", e))
        })?;
        keys.insert(key_id.into(), Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)));
        Ok(())
    }

    /// Rotate to a new active key
    ///
    /// The new key must already be registered via `add_key()`.
    pub fn rotate_to(&mut self, key_id: &str) -> Result<()> {
        let keys = self.keys.read().map_err(|e| {
            AuditError::Config(format!("Failed to acquire key lock: {}", e))
        })?;
        if !keys.contains_key(key_id) {
            return Err(AuditError::Config(format!(
                "Key '{}' not registered, add it first",
                key_id
            )));
        }
        drop(keys);
        self.active_key_id = key_id.to_string();
        Ok(())
    }

    pub fn active_key_id(&self) -> &str {
        &self.active_key_id
    }

    /// Encrypt a value into the blob layout understood by `decrypt`
    pub fn encrypt(&self, plaintext: &str, include_hash: bool) -> Result<Vec<u8>> {
        let keys = self.keys.read().map_err(|e| {
            AuditError::Config(format!("Failed to acquire key lock: {}", e))
        })?;
        let cipher = keys.get(&self.active_key_id).ok_or_else(|| {
            AuditError::Config(format!("Active key '{}' not found", self.active_key_id))
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AuditError::Decryption(format!("Encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(HASH_LEN + NONCE_LEN + ciphertext.len());
        if include_hash {
            blob.extend_from_slice(&Sha256::digest(plaintext.as_bytes()));
        }
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }
}

impl AuditDecryption for Aes256GcmDecryption {
    fn decrypt(&self, cipher_text: Option<&[u8]>, includes_hash: bool) -> Result<Option<String>> {
        let Some(blob) = cipher_text else {
            return Ok(None);
        };

        let (hash, rest) = if includes_hash {
            if blob.len() < HASH_LEN {
                return Err(AuditError::Decryption(format!(
                    "Blob of {} bytes is shorter than its hash prefix",
                    blob.len()
                )));
            }
            let (hash, rest) = blob.split_at(HASH_LEN);
            (Some(hash), rest)
        } else {
            (None, blob)
        };

        if rest.len() < NONCE_LEN {
            return Err(AuditError::Decryption(format!(
                "Blob of {} bytes is missing its nonce",
                blob.len()
            )));
        }
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let keys = self.keys.read().map_err(|e| {
            AuditError::Config(format!("Failed to acquire key lock: {}", e))
        })?;

        // Active key first, then any key kept around from before a rotation
        let plaintext = keys
            .get(&self.active_key_id)
            .into_iter()
            .chain(
                keys.iter()
                    .filter(|(id, _)| **id != self.active_key_id)
                    .map(|(_, cipher)| cipher),
            )
            .find_map(|cipher| cipher.decrypt(nonce, ciphertext).ok())
            .ok_or_else(|| {
                AuditError::Decryption("No registered key decrypts this value".to_string())
            })?;

        if let Some(expected) = hash {
            if Sha256::digest(&plaintext).as_slice() != expected {
                return Err(AuditError::Decryption(
                    "Decrypted value does not match its hash".to_string(),
                ));
            }
        }

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|e| AuditError::Decryption(format!("Decrypted value is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [0x42; 32]
    }

    fn test_key_2() -> [u8; 32] {
        [0x7A; 32]
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let dec = Aes256GcmDecryption::new("key-1", &test_key());
        let blob = dec.encrypt("123-45-6789", false).unwrap();
        assert_eq!(
            dec.decrypt(Some(blob.as_slice()), false).unwrap().as_deref(),
            Some("123-45-6789")
        );
    }

    #[test]
    fn test_hashed_blob_roundtrip() {
        let dec = Aes256GcmDecryption::new("key-1", &test_key());
        let blob = dec.encrypt("123-45-6789", true).unwrap();
        assert_eq!(
            dec.decrypt(Some(blob.as_slice()), true).unwrap().as_deref(),
            Some("123-45-6789")
        );
    }

    #[test]
    fn test_hash_flag_must_match() {
        let dec = Aes256GcmDecryption::new("key-1", &test_key());
        let blob = dec.encrypt("secret", true).unwrap();
        assert!(dec.decrypt(Some(blob.as_slice()), false).is_err());
    }

    #[test]
    fn test_tampered_hash_fails() {
        let dec = Aes256GcmDecryption::new("key-1", &test_key());
        let mut blob = dec.encrypt("secret", true).unwrap();
        blob[0] ^= 0xFF;
        assert!(matches!(
            dec.decrypt(Some(blob.as_slice()), true),
            Err(AuditError::Decryption(_))
        ));
    }

    #[test]
    fn test_null_passes_through() {
        let dec = Aes256GcmDecryption::new("key-1", &test_key());
        assert_eq!(dec.decrypt(None, true).unwrap(), None);
    }

    #[test]
    fn test_short_blob_fails() {
        let dec = Aes256GcmDecryption::new("key-1", &test_key());
        assert!(dec.decrypt(Some([1u8, 2, 3].as_slice()), false).is_err());
        assert!(dec.decrypt(Some([0u8; 8].as_slice()), true).is_err());
    }

    #[test]
    fn test_key_rotation() {
        let mut dec = Aes256GcmDecryption::new("key-1", &test_key());
        let old = dec.encrypt("before", false).unwrap();

        dec.add_key("key-2", &test_key_2()).unwrap();
        dec.rotate_to("key-2").unwrap();
        assert_eq!(dec.active_key_id(), "key-2");

        let new = dec.encrypt("after", false).unwrap();
        assert_eq!(dec.decrypt(Some(old.as_slice()), false).unwrap().as_deref(), Some("before"));
        assert_eq!(dec.decrypt(Some(new.as_slice()), false).unwrap().as_deref(), Some("after"));
    }

    #[test]
    fn test_rotate_to_unknown_key_fails() {
        let mut dec = Aes256GcmDecryption::new("key-1", &test_key());
        assert!(dec.rotate_to("nonexistent").is_err());
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let enc = Aes256GcmDecryption::new("key-1", &test_key());
        let dec = Aes256GcmDecryption::new("key-2", &test_key_2());
        let blob = enc.encrypt("secret", false).unwrap();
        assert!(dec.decrypt(Some(blob.as_slice()), false).is_err());
    }

    #[test]
    fn test_each_encryption_unique_nonce() {
        let dec = Aes256GcmDecryption::new("key-1", &test_key());
        let b1 = dec.encrypt("same", false).unwrap();
        let b2 = dec.encrypt("same", false).unwrap();
        assert_ne!(b1[..NONCE_LEN], b2[..NONCE_LEN]);
    }
}
