//! Secret-at-rest encryption.
//!
//! Graph-template secret values are sealed with AES-256-GCM under a
//! process-global key loaded once at startup from
//! `SECRETS_ENCRYPTION_KEY` (URL-safe base64 of 32 raw bytes). The wire
//! form is `urlsafe_b64(nonce || ciphertext || tag)`.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Environment variable carrying the encryption key.
pub const ENCRYPTION_KEY_ENV: &str = "SECRETS_ENCRYPTION_KEY";

const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretsError {
    #[error("{ENCRYPTION_KEY_ENV} is not set")]
    KeyMissing,
    #[error("key must be URL-safe base64 (44 chars for 32-byte key)")]
    KeyNotBase64,
    #[error("key must be {KEY_LEN} raw bytes (256 bits)")]
    KeyWrongLength,
    #[error("ciphertext is not URL-safe base64")]
    CiphertextNotBase64,
    #[error("ciphertext is truncated")]
    CiphertextTruncated,
    #[error("encryption failure")]
    Crypto,
}

/// Symmetric encrypter for secret values. Read-only after construction.
pub struct Encrypter {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for Encrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encrypter").finish_non_exhaustive()
    }
}

impl Encrypter {
    /// Build from the raw base64 key material.
    pub fn new(key_b64: &str) -> Result<Self, SecretsError> {
        let key_bytes = URL_SAFE
            .decode(key_b64)
            .map_err(|_| SecretsError::KeyNotBase64)?;
        if key_bytes.len() != KEY_LEN {
            return Err(SecretsError::KeyWrongLength);
        }
        let unbound =
            UnboundKey::new(&AES_256_GCM, &key_bytes).map_err(|_| SecretsError::Crypto)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from `SECRETS_ENCRYPTION_KEY`.
    pub fn from_env() -> Result<Self, SecretsError> {
        let key_b64 = std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| SecretsError::KeyMissing)?;
        Self::new(&key_b64)
    }

    /// Generate a fresh key in the accepted format.
    pub fn generate_key() -> String {
        let rng = SystemRandom::new();
        let mut key = [0u8; KEY_LEN];
        // SystemRandom only fails on exhausted platform entropy.
        rng.fill(&mut key).expect("system randomness unavailable");
        URL_SAFE.encode(key)
    }

    pub fn encrypt(&self, secret: &str) -> Result<String, SecretsError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| SecretsError::Crypto)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = secret.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| SecretsError::Crypto)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(URL_SAFE.encode(sealed))
    }

    pub fn decrypt(&self, sealed_b64: &str) -> Result<String, SecretsError> {
        let sealed = URL_SAFE
            .decode(sealed_b64)
            .map_err(|_| SecretsError::CiphertextNotBase64)?;
        if sealed.len() < NONCE_LEN {
            return Err(SecretsError::CiphertextTruncated);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| SecretsError::Crypto)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| SecretsError::Crypto)?;
        String::from_utf8(plaintext.to_vec()).map_err(|_| SecretsError::Crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_accepted() {
        let key = Encrypter::generate_key();
        assert_eq!(key.len(), 44);
        Encrypter::new(&key).unwrap();
    }

    #[test]
    fn round_trips_secret_values() {
        let encrypter = Encrypter::new(&Encrypter::generate_key()).unwrap();
        let sealed = encrypter.encrypt("s3cr3t value").unwrap();
        assert_ne!(sealed, "s3cr3t value");
        assert_eq!(encrypter.decrypt(&sealed).unwrap(), "s3cr3t value");
    }

    #[test]
    fn encryption_is_nonce_randomized() {
        let encrypter = Encrypter::new(&Encrypter::generate_key()).unwrap();
        let a = encrypter.encrypt("same").unwrap();
        let b = encrypter.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(encrypter.decrypt(&a).unwrap(), encrypter.decrypt(&b).unwrap());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert_eq!(
            Encrypter::new("not base64 !!!").unwrap_err(),
            SecretsError::KeyNotBase64
        );
        let short = URL_SAFE.encode([0u8; 16]);
        assert_eq!(
            Encrypter::new(&short).unwrap_err(),
            SecretsError::KeyWrongLength
        );
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let encrypter = Encrypter::new(&Encrypter::generate_key()).unwrap();
        let sealed = encrypter.encrypt("value").unwrap();
        let mut bytes = URL_SAFE.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = URL_SAFE.encode(bytes);
        assert_eq!(encrypter.decrypt(&tampered).unwrap_err(), SecretsError::Crypto);
    }

    #[test]
    fn decrypting_with_wrong_key_fails() {
        let a = Encrypter::new(&Encrypter::generate_key()).unwrap();
        let b = Encrypter::new(&Encrypter::generate_key()).unwrap();
        let sealed = a.encrypt("value").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }
}
