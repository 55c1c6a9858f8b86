//! AES-256-GCM sealing of token columns.
//!
//! Every value gets its own random 96-bit nonce; ciphertext and nonce are
//! stored base64-encoded side by side. The master key is 32 bytes, supplied
//! base64-encoded through `SOCIALSYNC_ENCRYPTION_KEY`, and lives in memory only.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

pub const ENCRYPTION_KEY_ENV: &str = "SOCIALSYNC_ENCRYPTION_KEY";

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// A sealed secret as stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
}

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// # Errors
    /// Fails unless `key_base64` decodes to exactly 32 bytes.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .context("Failed to decode base64 encryption key")?;

        if key_bytes.len() != KEY_SIZE {
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key_bytes.len()
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Read the key from `SOCIALSYNC_ENCRYPTION_KEY`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(ENCRYPTION_KEY_ENV)
            .with_context(|| format!("{} is not set", ENCRYPTION_KEY_ENV))?;
        Self::from_base64_key(&key)
    }

    /// Fresh random key, base64-encoded. For tests and first-time setup.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }

    pub fn seal(&self, plaintext: &str) -> Result<Sealed> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(Sealed {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
        })
    }

    /// # Errors
    /// Wrong key, wrong nonce and tampered ciphertext all fail authentication.
    pub fn open(&self, sealed: &Sealed) -> Result<String> {
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce = BASE64.decode(&sealed.nonce).context("Failed to decode nonce")?;

        if nonce.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            ));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| anyhow!("Decryption failed (wrong key or corrupted data)"))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(<key redacted>)")
    }
}
