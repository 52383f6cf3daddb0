//! Credential encryption using AES-256-GCM
//!
//! Credentials are encrypted as one serialized JSON unit. The envelope is
//! stored as three fields (ciphertext, IV, authentication tag), each base64
//! encoded. Decryption fails closed: a tag mismatch never yields partial data.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid envelope format: {0}")]
    InvalidFormat(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Secure wrapper for the 32-byte encryption key with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    /// Create a new crypto key from raw bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(CryptoKey(bytes))
    }

    /// Decode a base64-encoded 32-byte key
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// SHA-256 hex fingerprint of the key, used for the migration checkpoint.
    /// Never log or store the key itself.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }
}

/// Encrypted credential envelope as persisted: three base64 fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

/// Encrypt a serialized credentials object as one unit
pub fn encrypt_value(
    key: &CryptoKey,
    value: &serde_json::Value,
) -> Result<EncryptedEnvelope, CryptoError> {
    let plaintext =
        serde_json::to_vec(value).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the tag to the ciphertext; split it into its own field
    let mut sealed = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    debug_assert!(sealed.len() >= TAG_LEN);
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedEnvelope {
        ciphertext: BASE64.encode(&sealed),
        iv: BASE64.encode(nonce),
        auth_tag: BASE64.encode(&tag),
    })
}

/// Decrypt a three-field envelope back into the credentials object
pub fn decrypt_value(
    key: &CryptoKey,
    envelope: &EncryptedEnvelope,
) -> Result<serde_json::Value, CryptoError> {
    let mut sealed = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|e| CryptoError::InvalidFormat(format!("ciphertext: {}", e)))?;
    let iv = BASE64
        .decode(&envelope.iv)
        .map_err(|e| CryptoError::InvalidFormat(format!("iv: {}", e)))?;
    let tag = BASE64
        .decode(&envelope.auth_tag)
        .map_err(|e| CryptoError::InvalidFormat(format!("auth_tag: {}", e)))?;

    if iv.len() != NONCE_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "iv must be {} bytes, got {}",
            NONCE_LEN,
            iv.len()
        )));
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "auth tag must be {} bytes, got {}",
            TAG_LEN,
            tag.len()
        )));
    }

    sealed.extend_from_slice(&tag);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);
    let nonce = Nonce::from_slice(&iv);

    let plaintext = cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    serde_json::from_slice(&plaintext).map_err(|e| CryptoError::InvalidFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![7u8; 32]).expect("valid test key")
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key();
        let creds = json!({
            "type": "oauth2",
            "access_token": "tok-123",
            "refresh_token": "ref-456",
            "raw": {"access_token": "tok-123"}
        });

        let envelope = encrypt_value(&key, &creds).expect("encryption succeeds");
        let decrypted = decrypt_value(&key, &envelope).expect("decryption succeeds");

        assert_eq!(decrypted, creds);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let envelope = encrypt_value(&test_key(), &json!({"a": 1})).unwrap();
        let other = CryptoKey::new(vec![8u8; 32]).unwrap();

        let result = decrypt_value(&other, &envelope);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let key = test_key();
        let mut envelope = encrypt_value(&key, &json!({"secret": "x"})).unwrap();
        let mut bytes = BASE64.decode(&envelope.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        envelope.ciphertext = BASE64.encode(&bytes);

        let result = decrypt_value(&key, &envelope);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn tampered_tag_fails_closed() {
        let key = test_key();
        let mut envelope = encrypt_value(&key, &json!({"secret": "x"})).unwrap();
        let mut tag = BASE64.decode(&envelope.auth_tag).unwrap();
        tag[0] ^= 0x01;
        envelope.auth_tag = BASE64.encode(&tag);

        let result = decrypt_value(&key, &envelope);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn iv_uniqueness() {
        let key = test_key();
        let creds = json!({"token": "same"});
        let a = encrypt_value(&key, &creds).unwrap();
        let b = encrypt_value(&key, &creds).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_eq!(decrypt_value(&key, &a).unwrap(), creds);
        assert_eq!(decrypt_value(&key, &b).unwrap(), creds);
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert!(CryptoKey::new(vec![0u8; 16]).is_err());
        assert!(CryptoKey::new(vec![0u8; 64]).is_err());
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let key = test_key();
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, test_key().fingerprint());
    }
}
