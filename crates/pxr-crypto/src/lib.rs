//! Authenticated encryption for credentials at rest.
//!
//! Refresh tokens and proxy passwords are stored as XChaCha20-Poly1305
//! ciphertext, base64-encoded, with the 24-byte nonce prepended. The key is a
//! base64-encoded 32-byte value resolved once at startup (`FIELD_ENCRYPTION_KEY`
//! or its key file); it must never appear in logs or `Debug` output.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, XChaCha20Poly1305, XNonce};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption key is not valid base64 or has the wrong length")]
    InvalidKey,
    #[error("ciphertext is malformed or was produced under a different key")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

/// Symmetric field encryptor. Cheap to clone; holds only the key material.
#[derive(Clone)]
pub struct FieldEncryptor {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for FieldEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is never printed.
        f.debug_struct("FieldEncryptor")
            .field("key", &"<REDACTED>")
            .finish()
    }
}

impl FieldEncryptor {
    /// Build an encryptor from a base64-encoded 32-byte key.
    pub fn from_key(key_b64: &str) -> Result<Self, CryptoError> {
        let raw = B64
            .decode(key_b64.trim())
            .map_err(|_| CryptoError::InvalidKey)?;
        let key: [u8; KEY_LEN] = raw.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Generate a fresh random key in the storable base64 form.
    pub fn generate_key() -> String {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        B64.encode(key)
    }

    /// Encrypt a UTF-8 secret. Output is `base64(nonce || ciphertext)`.
    pub fn encrypt_text(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher =
            XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKey)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(B64.encode(out))
    }

    /// Decrypt a value previously produced by [`encrypt_text`].
    ///
    /// [`encrypt_text`]: FieldEncryptor::encrypt_text
    pub fn decrypt_text(&self, stored: &str) -> Result<String, CryptoError> {
        let raw = B64
            .decode(stored.trim())
            .map_err(|_| CryptoError::Decrypt)?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ct) = raw.split_at(NONCE_LEN);
        let cipher =
            XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKey)?;
        let nonce = XNonce::from_slice(nonce_bytes);
        let pt = cipher.decrypt(nonce, ct).map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(pt).map_err(|_| CryptoError::Decrypt)
    }
}

/// Visual hint for a stored secret: first and last four characters with the
/// middle elided. Short secrets are fully masked.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let enc = FieldEncryptor::from_key(&FieldEncryptor::generate_key()).unwrap();
        let stored = enc.encrypt_text("rt_secret_value").unwrap();
        assert_ne!(stored, "rt_secret_value");
        assert_eq!(enc.decrypt_text(&stored).unwrap(), "rt_secret_value");
    }

    #[test]
    fn ciphertexts_differ_per_call() {
        let enc = FieldEncryptor::from_key(&FieldEncryptor::generate_key()).unwrap();
        let a = enc.encrypt_text("same").unwrap();
        let b = enc.encrypt_text("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let enc_a = FieldEncryptor::from_key(&FieldEncryptor::generate_key()).unwrap();
        let enc_b = FieldEncryptor::from_key(&FieldEncryptor::generate_key()).unwrap();
        let stored = enc_a.encrypt_text("secret").unwrap();
        assert!(enc_b.decrypt_text(&stored).is_err());
    }

    #[test]
    fn invalid_key_rejected() {
        assert!(FieldEncryptor::from_key("not-base64!!").is_err());
        assert!(FieldEncryptor::from_key(&B64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn masking_keeps_only_a_hint() {
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("abcdefghijkl"), "abcd...ijkl");
    }

    #[test]
    fn debug_output_redacts_key() {
        let enc = FieldEncryptor::from_key(&FieldEncryptor::generate_key()).unwrap();
        assert!(format!("{enc:?}").contains("<REDACTED>"));
    }
}
