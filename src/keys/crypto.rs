//! AES-256-GCM sealing for versioned key material.
//!
//! Sealed payload layout:
//! ```text
//! [version: 4 bytes BE][nonce: 12 bytes][ciphertext + tag]
//! ```
//! The version header and the key type are bound into the associated data, so a payload
//! cannot be replayed under another key type or relabelled with another version.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, KeyValidationError, RotationError};

use super::models::KeyType;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const VERSION_SIZE: usize = 4;
const MIN_SEALED_SIZE: usize = VERSION_SIZE + NONCE_SIZE + TAG_SIZE;

/// 256-bit secret. Zeroized on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl SecretKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(name: &str, bytes: &[u8]) -> Result<Self, KeyValidationError> {
        if bytes.len() != KEY_SIZE {
            return Err(KeyValidationError::Length {
                name: name.to_string(),
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn from_base64(name: &str, encoded: &str) -> Result<Self, KeyValidationError> {
        let trimmed = encoded.trim();
        if trimmed.is_empty() {
            return Err(KeyValidationError::Missing {
                name: name.to_string(),
            });
        }
        let decoded = Zeroizing::new(STANDARD.decode(trimmed).map_err(|err| {
            KeyValidationError::Encoding {
                name: name.to_string(),
                reason: err.to_string(),
            }
        })?);
        Self::from_slice(name, &decoded)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short, non-reversible identifier safe to log and persist.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..8])
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    pub fn seal(
        &self,
        key_type: KeyType,
        version: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let header = version.to_be_bytes();
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let aad = associated_data(key_type, &header);

        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(VERSION_SIZE + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&header);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, key_type: KeyType, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < MIN_SEALED_SIZE {
            return Err(CryptoError::Truncated);
        }
        let (header, rest) = sealed.split_at(VERSION_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        let aad = associated_data(key_type, header);
        self.cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Decrypt)
    }
}

/// Key version a sealed payload was produced under.
pub fn sealed_version(sealed: &[u8]) -> Result<u32, CryptoError> {
    if sealed.len() < MIN_SEALED_SIZE {
        return Err(CryptoError::Truncated);
    }
    let mut header = [0u8; VERSION_SIZE];
    header.copy_from_slice(&sealed[..VERSION_SIZE]);
    Ok(u32::from_be_bytes(header))
}

fn associated_data(key_type: KeyType, header: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_type.as_str().len() + 1 + header.len());
    aad.extend_from_slice(key_type.as_str().as_bytes());
    aad.push(b':');
    aad.extend_from_slice(header);
    aad
}

/// key: key-wrapping
/// Master key encrypting key material at rest. Loaded once at startup.
#[derive(Clone, Debug)]
pub struct MasterKey(SecretKey);

impl MasterKey {
    pub const ENV_NAME: &'static str = "KEY_ENCRYPTION_KEY";

    pub fn from_base64(encoded: &str) -> Result<Self, KeyValidationError> {
        SecretKey::from_base64(Self::ENV_NAME, encoded).map(Self)
    }

    pub fn new(secret: SecretKey) -> Self {
        Self(secret)
    }

    pub fn wrap(
        &self,
        key_type: KeyType,
        version: u32,
        secret: &SecretKey,
    ) -> Result<Vec<u8>, CryptoError> {
        self.0.seal(key_type, version, secret.as_bytes())
    }

    pub fn unwrap_key(&self, key_type: KeyType, wrapped: &[u8]) -> Result<SecretKey, RotationError> {
        let plain = Zeroizing::new(self.0.open(key_type, wrapped)?);
        Ok(SecretKey::from_slice(key_type.as_str(), &plain)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let key = SecretKey::generate();
        let sealed = key.seal(KeyType::TokenEncryption, 7, b"oauth-token").unwrap();
        assert_eq!(sealed_version(&sealed).unwrap(), 7);
        let opened = key.open(KeyType::TokenEncryption, &sealed).unwrap();
        assert_eq!(opened, b"oauth-token");
    }

    #[test]
    fn key_type_is_bound_into_ciphertext() {
        let key = SecretKey::generate();
        let sealed = key.seal(KeyType::TokenEncryption, 1, b"secret").unwrap();
        assert_eq!(
            key.open(KeyType::WebhookSigning, &sealed),
            Err(CryptoError::Decrypt)
        );
    }

    #[test]
    fn relabelled_version_fails_authentication() {
        let key = SecretKey::generate();
        let mut sealed = key.seal(KeyType::JwtSigning, 1, b"payload").unwrap();
        sealed[3] = 2;
        assert_eq!(key.open(KeyType::JwtSigning, &sealed), Err(CryptoError::Decrypt));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert_eq!(sealed_version(&[0, 0, 1]), Err(CryptoError::Truncated));
    }

    #[test]
    fn malformed_master_key_is_a_validation_failure() {
        let err = MasterKey::from_base64("not base64 !!").unwrap_err();
        assert!(matches!(err, KeyValidationError::Encoding { .. }));

        let short = STANDARD.encode([1u8; 16]);
        let err = MasterKey::from_base64(&short).unwrap_err();
        assert_eq!(
            err,
            KeyValidationError::Length {
                name: MasterKey::ENV_NAME.to_string(),
                expected: KEY_SIZE,
                actual: 16,
            }
        );

        assert!(matches!(
            MasterKey::from_base64("  ").unwrap_err(),
            KeyValidationError::Missing { .. }
        ));
    }

    #[test]
    fn wrap_round_trip_preserves_fingerprint() {
        let master = MasterKey::new(SecretKey::generate());
        let secret = SecretKey::generate();
        let wrapped = master.wrap(KeyType::ApiKeyHashing, 3, &secret).unwrap();
        let unwrapped = master.unwrap_key(KeyType::ApiKeyHashing, &wrapped).unwrap();
        assert_eq!(unwrapped.fingerprint(), secret.fingerprint());
    }
}
