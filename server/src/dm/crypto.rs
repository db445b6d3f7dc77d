//! AES-256-GCM at-rest encryption for stored message bodies.
//!
//! Key: 256-bit, either loaded from the data directory or derived with
//! HKDF-SHA256 from an operator-supplied secret.
//! Stored format: base64(nonce (12 bytes) || ciphertext (includes GCM tag))

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use rand::Rng;
use sha2::Sha256;

pub const NONCE_LEN: usize = 12;

/// Salt for HKDF key derivation (domain separation)
const HKDF_SALT: &[u8] = b"pairchat-message-key-v1";

/// Info string for HKDF key derivation (purpose binding)
const HKDF_INFO: &[u8] = b"pairchat-server-message-encryption";

/// Why a stored blob could not be turned back into text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptionFailure {
    #[error("stored blob is not valid base64")]
    Encoding,
    #[error("stored blob shorter than the nonce")]
    TooShort,
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("decrypted bytes are not UTF-8")]
    NotUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message encryption failed")]
pub struct EncryptionFailure;

pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl MessageCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from(*key);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Derive the message key from a configured secret.
    pub fn from_secret(secret: &str) -> Self {
        Self::new(&derive_key(secret.as_bytes()))
    }

    /// Encrypt with a fresh random nonce; never reuses a nonce for this key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionFailure> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| EncryptionFailure)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, DecryptionFailure> {
        let raw = STANDARD
            .decode(blob)
            .map_err(|_| DecryptionFailure::Encoding)?;
        if raw.len() < NONCE_LEN {
            return Err(DecryptionFailure::TooShort);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DecryptionFailure::Authentication)?;
        String::from_utf8(plaintext).map_err(|_| DecryptionFailure::NotUtf8)
    }
}

fn derive_key(secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("HKDF expand should not fail for 32-byte output");
    okm
}
