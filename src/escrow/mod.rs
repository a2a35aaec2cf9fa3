//! Shamir Three-Pass Escrow
//!
//! The relay holds a long-lived exponent pair `(e_s, d_s)` and only ever
//! sees client-locked or double-locked KEKs. The client keeps the VRF
//! keypair encrypted under the KEK plus the server-locked `kek_s`; unlocking
//! needs one round trip to `remove-server-lock`.
//!
//! - [`shamir`]: lock arithmetic and the typed escrow states
//! - [`service`]: server-side key management with rotation
//! - [`keystore`]: encrypted-at-rest storage for the server exponents

pub mod keystore;
pub mod service;
pub mod shamir;

pub use keystore::{KeystoreError, ShamirKeystore};
pub use service::{derive_key_id, KeyInfo, ServerKeyMaterial, ShamirEscrowService};
pub use shamir::{ClientLocked, DoubleLocked, EscrowedKey, Kek, LockKeys, ServerLocked, Shamir3Pass};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use num_bigint::BigUint;
use thiserror::Error;

use crate::error::ErrorKind;

/// Escrow errors
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("escrow disabled: {0}")]
    Disabled(&'static str),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid modulus: {0}")]
    InvalidModulus(String),

    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("relay request failed: {0}")]
    Transport(String),

    #[error("relay rejected request [{code}]: {message}")]
    Rejected { code: String, message: String },
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscrowError::Disabled(_) => ErrorKind::EscrowDisabled,
            EscrowError::InvalidEncoding(_)
            | EscrowError::InvalidValue(_)
            | EscrowError::UnknownKeyId(_) => ErrorKind::MalformedInput,
            EscrowError::Transport(_) => ErrorKind::Transport,
            EscrowError::Rejected { code, .. } if code == "SHAMIR_DISABLED" => {
                ErrorKind::EscrowDisabled
            }
            EscrowError::Rejected { .. }
            | EscrowError::InvalidModulus(_)
            | EscrowError::KeyGeneration(_)
            | EscrowError::Encryption(_)
            | EscrowError::Decryption(_) => ErrorKind::Internal,
        }
    }
}

pub fn encode_biguint_b64u(value: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

pub fn decode_biguint_b64u(encoded: &str) -> Result<BigUint, EscrowError> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(EscrowError::InvalidEncoding("empty value".to_string()));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| EscrowError::InvalidEncoding(e.to_string()))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// The relay's long-lived exponent pair
#[derive(Clone)]
pub struct ServerKeypair {
    pub e_s: BigUint,
    pub d_s: BigUint,
}

impl ServerKeypair {
    pub fn e_s_b64u(&self) -> String {
        encode_biguint_b64u(&self.e_s)
    }

    pub fn d_s_b64u(&self) -> String {
        encode_biguint_b64u(&self.d_s)
    }
}

impl From<LockKeys> for ServerKeypair {
    fn from(keys: LockKeys) -> Self {
        Self {
            e_s: keys.e,
            d_s: keys.d,
        }
    }
}

impl std::fmt::Debug for ServerKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeypair").finish_non_exhaustive()
    }
}
