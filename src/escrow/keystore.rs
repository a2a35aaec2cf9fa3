//! Encrypted Shamir server key storage
//!
//! The relay's `(e_s, d_s)` pair is encrypted at rest using AES-256-GCM with
//! a password-derived key.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

use super::{decode_biguint_b64u, ServerKeypair};

/// Key store errors
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("key not found")]
    KeyNotFound,
    #[error("invalid password")]
    InvalidPassword,
}

/// Encrypted key file format
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    /// Version for future format changes
    version: u8,
    /// Server key identifier
    key_id: String,
    /// Salt for key derivation (hex-encoded)
    salt: String,
    /// Nonce for AES-GCM (hex-encoded)
    nonce: String,
    /// Encrypted exponents (hex-encoded)
    ciphertext: String,
    /// Prime modulus the exponents belong to (base64url)
    p_b64u: String,
}

/// Exponents before encryption
#[derive(Serialize, Deserialize)]
struct ServerExponents {
    e_s_b64u: String,
    d_s_b64u: String,
}

/// Encrypted keystore for the relay's Shamir exponents
pub struct ShamirKeystore {
    /// Path to key file
    key_path: std::path::PathBuf,
}

impl ShamirKeystore {
    pub fn new(key_path: impl AsRef<Path>) -> Self {
        Self {
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// Check if key file exists
    pub fn exists(&self) -> bool {
        self.key_path.exists()
    }

    /// Derive encryption key from password using SHA-256
    fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt);
        hasher.update(b"vrf-relay-shamir-keystore-v1");
        Zeroizing::new(hasher.finalize().into())
    }

    /// Save the exponent pair encrypted with password
    pub fn save(
        &self,
        key_id: &str,
        keypair: &ServerKeypair,
        p_b64u: &str,
        password: &str,
    ) -> Result<(), KeystoreError> {
        let exponents = ServerExponents {
            e_s_b64u: keypair.e_s_b64u(),
            d_s_b64u: keypair.d_s_b64u(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&exponents)?);

        let mut salt = [0u8; 16];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = Self::derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;

        let encrypted = EncryptedKeyFile {
            version: 1,
            key_id: key_id.to_string(),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
            p_b64u: p_b64u.to_string(),
        };

        let json = serde_json::to_string_pretty(&encrypted)?;
        if let Some(parent) = self.key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.key_path, json)?;

        tracing::info!(
            key_id = %key_id,
            path = %self.key_path.display(),
            "Saved encrypted Shamir server key"
        );

        Ok(())
    }

    /// Load `(key_id, keypair)` decrypted with password
    pub fn load(&self, password: &str) -> Result<(String, ServerKeypair), KeystoreError> {
        if !self.exists() {
            return Err(KeystoreError::KeyNotFound);
        }

        let json = std::fs::read_to_string(&self.key_path)?;
        let encrypted: EncryptedKeyFile = serde_json::from_str(&json)?;

        let salt =
            hex::decode(&encrypted.salt).map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let nonce_bytes =
            hex::decode(&encrypted.nonce).map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let ciphertext = hex::decode(&encrypted.ciphertext)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(KeystoreError::Decryption("bad nonce length".to_string()));
        }

        let key = Self::derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
                .map_err(|_| KeystoreError::InvalidPassword)?,
        );

        let exponents: ServerExponents = serde_json::from_slice(&plaintext)?;
        let keypair = ServerKeypair {
            e_s: decode_biguint_b64u(&exponents.e_s_b64u)
                .map_err(|e| KeystoreError::Decryption(e.to_string()))?,
            d_s: decode_biguint_b64u(&exponents.d_s_b64u)
                .map_err(|e| KeystoreError::Decryption(e.to_string()))?,
        };

        tracing::info!(
            key_id = %encrypted.key_id,
            path = %self.key_path.display(),
            "Loaded Shamir server key"
        );

        Ok((encrypted.key_id, keypair))
    }

    /// Modulus recorded alongside the key, readable without the password
    pub fn modulus_b64u(&self) -> Result<String, KeystoreError> {
        if !self.exists() {
            return Err(KeystoreError::KeyNotFound);
        }
        let json = std::fs::read_to_string(&self.key_path)?;
        let encrypted: EncryptedKeyFile = serde_json::from_str(&json)?;
        Ok(encrypted.p_b64u)
    }
}
