//! Outbound payload encryption.
//!
//! When `encrypt_coms` is on, reply payloads are replaced by a base64 string
//! of `salt || nonce || ciphertext`, sealed with AES-256-GCM under a key
//! derived from the shared password (PBKDF2-HMAC-SHA256). The salt is random
//! per process, so the derived key is computed once and cached until the
//! password changes. Derivation is slow on purpose; [`PayloadCipher::prepare`]
//! runs it on the blocking pool so `encode` finds the key ready.
//!
//! The wire format is this crate's own and is not compatible with
//! CryptoJS passphrase output.
//!
//! This is obfuscation over a pre-shared key. It is not a transport security
//! boundary.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::ConfigStore;

/// The one channel that is never encrypted; it already carries base64 bytes.
pub const EXEMPT_CHANNEL: &str = "attachment-chunk";

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("random number generation failed: {0}")]
    RandomFailure(String),

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid encrypted payload: {0}")]
    InvalidFormat(String),

    #[error("key derivation task failed: {0}")]
    KeyDerivation(String),
}

struct CachedKey {
    passphrase: Zeroizing<String>,
    key: Zeroizing<[u8; KEY_LEN]>,
}

/// Encrypts outbound payloads according to the live config.
pub struct PayloadCipher {
    config: Arc<ConfigStore>,
    salt: [u8; SALT_LEN],
    cached: Mutex<Option<CachedKey>>,
}

impl PayloadCipher {
    pub fn new(config: Arc<ConfigStore>) -> Result<Self, CipherError> {
        let mut salt = [0u8; SALT_LEN];
        getrandom::fill(&mut salt).map_err(|e| CipherError::RandomFailure(e.to_string()))?;
        Ok(Self {
            config,
            salt,
            cached: Mutex::new(None),
        })
    }

    /// Make sure the key for the current password is cached, deriving it
    /// off the async runtime if needed. A no-op while encryption is off.
    pub async fn prepare(&self) -> Result<(), CipherError> {
        if !self.config.encrypt_coms() {
            return Ok(());
        }
        let passphrase = Zeroizing::new(self.config.password());
        if self.cached_key(&passphrase).is_some() {
            return Ok(());
        }
        let salt = self.salt;
        let input = passphrase.clone();
        let key = tokio::task::spawn_blocking(move || {
            Zeroizing::new(derive_key(input.as_bytes(), &salt))
        })
        .await
        .map_err(|e| CipherError::KeyDerivation(e.to_string()))?;
        *self.cached.lock() = Some(CachedKey { passphrase, key });
        Ok(())
    }

    /// Encode `payload` for `channel`.
    ///
    /// Returns the payload to put on the wire and whether it was encrypted.
    /// Strings are sealed as-is; anything else is serialized to JSON text
    /// first.
    pub fn encode(&self, channel: &str, payload: Value) -> Result<(Value, bool), CipherError> {
        if channel == EXEMPT_CHANNEL || !self.config.encrypt_coms() {
            return Ok((payload, false));
        }

        let plaintext = match payload {
            Value::String(text) => text,
            other => serde_json::to_string(&other)?,
        };
        let sealed = self.seal(&plaintext, &self.config.password())?;
        Ok((Value::String(sealed), true))
    }

    fn seal(&self, plaintext: &str, passphrase: &str) -> Result<String, CipherError> {
        let key = self.key_for(passphrase);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce_bytes).map_err(|e| CipherError::RandomFailure(e.to_string()))?;

        let cipher = Aes256Gcm::new(key.as_ref().into());
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    fn cached_key(&self, passphrase: &str) -> Option<Zeroizing<[u8; KEY_LEN]>> {
        self.cached
            .lock()
            .as_ref()
            .filter(|entry| entry.passphrase.as_str() == passphrase)
            .map(|entry| entry.key.clone())
    }

    fn key_for(&self, passphrase: &str) -> Zeroizing<[u8; KEY_LEN]> {
        if let Some(key) = self.cached_key(passphrase) {
            return key;
        }
        // Derived outside the lock; a racing caller at worst derives twice.
        let key = Zeroizing::new(derive_key(passphrase.as_bytes(), &self.salt));
        *self.cached.lock() = Some(CachedKey {
            passphrase: Zeroizing::new(passphrase.to_string()),
            key: key.clone(),
        });
        key
    }
}

/// Derive a 256-bit key from a passphrase and salt using PBKDF2-HMAC-SHA256.
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase, salt, PBKDF2_ITERATIONS, &mut out);
    out
}

/// Reverse of [`PayloadCipher::encode`] for a sealed string.
pub fn decrypt(encoded: &str, passphrase: &str) -> Result<String, CipherError> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| CipherError::InvalidFormat(e.to_string()))?;
    if raw.len() < SALT_LEN + NONCE_LEN {
        return Err(CipherError::InvalidFormat(format!(
            "expected at least {} bytes, got {}",
            SALT_LEN + NONCE_LEN,
            raw.len()
        )));
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = Zeroizing::new(derive_key(passphrase.as_bytes(), salt));
    let cipher = Aes256Gcm::new(key.as_ref().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| CipherError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use serde_json::json;

    fn cipher(enabled: bool, password: &str) -> PayloadCipher {
        let store = ConfigStore::new(GatewayConfig {
            encrypt_coms: enabled,
            password: password.to_string(),
            ..GatewayConfig::default()
        });
        PayloadCipher::new(Arc::new(store)).unwrap()
    }

    #[test]
    fn test_disabled_is_passthrough() {
        let c = cipher(false, "pw");
        let payload = json!({"guid": "abc", "n": [1, 2, 3]});
        let (out, encrypted) = c.encode("chats", payload.clone()).unwrap();
        assert!(!encrypted);
        assert_eq!(out, payload);
    }

    #[test]
    fn test_string_round_trip() {
        let c = cipher(true, "pw");
        let (out, encrypted) = c.encode("logs", json!("line one\nline two")).unwrap();
        assert!(encrypted);
        let text = out.as_str().unwrap();
        assert_eq!(decrypt(text, "pw").unwrap(), "line one\nline two");
    }

    #[test]
    fn test_json_round_trip() {
        let c = cipher(true, "pw");
        let payload = json!({"guid": "abc", "participants": [{"address": "x"}], "n": null});
        let (out, encrypted) = c.encode("chat", payload.clone()).unwrap();
        assert!(encrypted);
        let text = decrypt(out.as_str().unwrap(), "pw").unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_attachment_chunk_never_encrypted() {
        let c = cipher(true, "pw");
        let (out, encrypted) = c.encode(EXEMPT_CHANNEL, json!("AAEC")).unwrap();
        assert!(!encrypted);
        assert_eq!(out, json!("AAEC"));
    }

    #[test]
    fn test_each_encoding_differs() {
        let c = cipher(true, "pw");
        let (a, _) = c.encode("logs", json!("same")).unwrap();
        let (b, _) = c.encode("logs", json!("same")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let c = cipher(true, "right");
        let (out, _) = c.encode("logs", json!("secret")).unwrap();
        assert!(matches!(
            decrypt(out.as_str().unwrap(), "wrong"),
            Err(CipherError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_password_change_rekeys() {
        let store = Arc::new(ConfigStore::new(GatewayConfig {
            encrypt_coms: true,
            password: "first".to_string(),
            ..GatewayConfig::default()
        }));
        let c = PayloadCipher::new(store.clone()).unwrap();
        let (before, _) = c.encode("logs", json!("x")).unwrap();
        store.update(|cfg| cfg.password = "second".to_string());
        let (after, _) = c.encode("logs", json!("x")).unwrap();
        assert!(decrypt(before.as_str().unwrap(), "first").is_ok());
        assert!(decrypt(after.as_str().unwrap(), "second").is_ok());
        assert!(decrypt(after.as_str().unwrap(), "first").is_err());
    }

    #[tokio::test]
    async fn test_prepare_caches_key() {
        let c = cipher(true, "pw");
        assert!(c.cached_key("pw").is_none());
        c.prepare().await.unwrap();
        assert!(c.cached_key("pw").is_some());

        let (out, _) = c.encode("logs", json!("x")).unwrap();
        assert_eq!(decrypt(out.as_str().unwrap(), "pw").unwrap(), "x");

        let off = cipher(false, "pw");
        off.prepare().await.unwrap();
        assert!(off.cached_key("pw").is_none());
    }

    #[test]
    fn test_truncated_input_rejected() {
        assert!(matches!(
            decrypt("AAAA", "pw"),
            Err(CipherError::InvalidFormat(_))
        ));
    }
}
