//! Webhook shared secrets.
//!
//! Secrets are shown to the endpoint owner once, at creation, and stored encrypted with AES-256-GCM so that the
//! dispatcher can recover the plaintext to sign payloads. The stored form is `base64(nonce || ciphertext)`.
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
    Key,
    Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hc_common::Secret;
use log::*;
use rand::RngCore;

use crate::traits::WebhookError;

const SECRET_PREFIX: &str = "whsec_";
const SECRET_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

/// Generates a fresh shared secret with 256 bits of entropy.
pub fn generate_webhook_secret() -> Secret<String> {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    Secret::new(format!("{SECRET_PREFIX}{}", hex::encode(bytes)))
}

#[derive(Clone)]
pub struct SecretVault {
    key: Secret<[u8; 32]>,
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretVault({:?})", self.key)
    }
}

impl SecretVault {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key: Secret::new(key) }
    }

    /// Builds a vault from a 64-character hex key.
    pub fn from_hex(key: &str) -> Result<Self, WebhookError> {
        let bytes = hex::decode(key.trim()).map_err(|e| WebhookError::SecretError(format!("Invalid key. {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WebhookError::SecretError("The encryption key must be exactly 32 bytes (64 hex chars)".into()))?;
        Ok(Self::new(key))
    }

    /// A vault with a throwaway key. Secrets encrypted with it cannot be recovered after a restart.
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.reveal()))
    }

    pub fn encrypt(&self, plaintext: &Secret<String>) -> Result<String, WebhookError> {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.reveal().as_bytes())
            .map_err(|e| WebhookError::SecretError(format!("Encryption failed. {e}")))?;
        let mut stored = nonce.to_vec();
        stored.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(stored))
    }

    pub fn decrypt(&self, stored: &str) -> Result<Secret<String>, WebhookError> {
        let data = STANDARD.decode(stored).map_err(|e| WebhookError::SecretError(format!("Corrupt secret. {e}")))?;
        if data.len() <= NONCE_BYTES {
            return Err(WebhookError::SecretError("Corrupt secret. Too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_BYTES);
        let plaintext = self.cipher().decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|e| {
            warn!("🪝️ A webhook secret could not be decrypted. Was the encryption key changed? {e}");
            WebhookError::SecretError("The secret could not be decrypted".into())
        })?;
        String::from_utf8(plaintext)
            .map(Secret::new)
            .map_err(|_| WebhookError::SecretError("Decrypted secret is not valid UTF-8".into()))
    }
}
