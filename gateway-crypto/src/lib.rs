//! Transparent AES-256-GCM encryption for account credential fields.
//!
//! The store has no I/O of its own — it is a pure transformer that
//! `gateway-store` wraps around every secret column on write and read.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

const WIRE_PREFIX: &str = "enc:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("malformed enc: wire format: {0}")]
    InvalidWireFormat(String),
    #[error("AEAD decryption failed, credential may be tampered or key is wrong")]
    AeadFailure,
}

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("AEAD encryption failed")]
    AeadFailure,
}

/// 32-byte AES-256 key derived from a configured passphrase (typically the
/// same secret used to sign JWTs). `Debug` intentionally does not print the
/// key material.
#[derive(Clone)]
pub struct MasterKey(Key<Aes256Gcm>);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").field("key", &"<redacted>").finish()
    }
}

impl MasterKey {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        Self(*Key::<Aes256Gcm>::from_slice(&digest))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.0)
    }
}

/// Encrypts `plaintext`, returning the `enc:` wire format: `enc:` followed
/// by base64(nonce || ciphertext).
pub fn encrypt(key: &MasterKey, plaintext: &str) -> Result<String, EncryptError> {
    let cipher = key.cipher();
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext =
        cipher.encrypt(&nonce, plaintext.as_bytes()).map_err(|_| EncryptError::AeadFailure)?;

    let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ciphertext);

    Ok(format!("{WIRE_PREFIX}{}", base64::engine::general_purpose::STANDARD.encode(wire)))
}

/// Decrypts a value produced by [`encrypt`]. A value without the `enc:`
/// prefix is returned unchanged — legacy plaintext compatibility.
pub fn decrypt(key: &MasterKey, stored: &str) -> Result<String, DecryptError> {
    let Some(encoded) = stored.strip_prefix(WIRE_PREFIX) else {
        return Ok(stored.to_string());
    };

    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| DecryptError::InvalidWireFormat(e.to_string()))?;

    if raw.len() < NONCE_LEN {
        return Err(DecryptError::InvalidWireFormat("ciphertext shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

    let cipher = key.cipher();
    let plaintext = cipher
        .decrypt(nonce_bytes.into(), ciphertext)
        .map_err(|_| DecryptError::AeadFailure)?;

    String::from_utf8(plaintext)
        .map_err(|e| DecryptError::InvalidWireFormat(format!("non-utf8 plaintext: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MasterKey {
        MasterKey::from_passphrase("test-only-passphrase")
    }

    #[test]
    fn round_trip_preserves_plaintext() {
        let k = key();
        let cases = ["", "sk-ant-api03-abc123", "a longer secret with spaces and 🔑 unicode"];
        for plaintext in cases {
            let wire = encrypt(&k, plaintext).expect("encrypt");
            assert!(wire.starts_with(WIRE_PREFIX));
            let recovered = decrypt(&k, &wire).expect("decrypt");
            assert_eq!(recovered, plaintext);
        }
    }

    #[test]
    fn legacy_plaintext_without_prefix_passes_through() {
        let k = key();
        let legacy = "sk-legacy-unencrypted-key";
        assert_eq!(decrypt(&k, legacy).expect("decrypt"), legacy);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let wire = encrypt(&key(), "top-secret").expect("encrypt");
        let other = MasterKey::from_passphrase("a different passphrase");
        assert!(matches!(decrypt(&other, &wire), Err(DecryptError::AeadFailure)));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let k = key();
        assert!(matches!(decrypt(&k, "enc:not-valid-base64!!"), Err(DecryptError::InvalidWireFormat(_))));
        assert!(matches!(decrypt(&k, "enc:"), Err(DecryptError::InvalidWireFormat(_))));
    }
}
