//! VRF keypair custody inside the worker.
//!
//! The manager holds at most one keypair. Unlocking or bootstrapping a new
//! one drops the previous keypair, which zeroizes it. Nothing in here ever
//! returns secret bytes to the page side; the only exits are encrypted
//! blobs, public keys, and VRF proofs.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::messages::{
    b64u_decode, b64u_encode, BootstrapResponse, EncryptWithPrfResponse, EncryptedVrfKeypair,
    MintRequest, MintResponse, UnlockResponse, VrfChallenge, VrfInputData, VrfStatus,
};
use super::VrfWorkerError;
use crate::clock::Clock;
use crate::logging::log_session_event;

/// Domain separator hashed into every VRF input
pub const VRF_DOMAIN_SEPARATOR: &[u8] = b"web3_authn_vrf_challenge_v1";

/// HKDF info for the AES key derived from PRF output
pub const HKDF_AES_KEY_INFO: &[u8] = b"vrf-aes-key";

const AES_KEY_SIZE: usize = 32;
const AES_NONCE_SIZE: usize = 12;
const VRF_SECRET_SIZE: usize = 32;

fn derive_aes_key(prf: &[u8]) -> Result<Zeroizing<[u8; AES_KEY_SIZE]>, VrfWorkerError> {
    let hk = Hkdf::<Sha256>::new(None, prf);
    let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
    hk.expand(HKDF_AES_KEY_INFO, &mut key[..])
        .map_err(|_| VrfWorkerError::KeyDerivation)?;
    Ok(key)
}

fn encrypt_keypair(keypair: &SigningKey, prf: &[u8]) -> Result<EncryptedVrfKeypair, VrfWorkerError> {
    let key = derive_aes_key(prf)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| VrfWorkerError::Encryption(e.to_string()))?;

    let mut nonce = [0u8; AES_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let secret = Zeroizing::new(keypair.to_bytes());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), &secret[..])
        .map_err(|e| VrfWorkerError::Encryption(e.to_string()))?;

    Ok(EncryptedVrfKeypair {
        encrypted_vrf_data_b64u: b64u_encode(&ciphertext),
        aes_gcm_nonce_b64u: b64u_encode(&nonce),
    })
}

fn decrypt_keypair(
    encrypted: &EncryptedVrfKeypair,
    prf: &[u8],
) -> Result<SigningKey, VrfWorkerError> {
    let ciphertext = b64u_decode(&encrypted.encrypted_vrf_data_b64u)?;
    let nonce = b64u_decode(&encrypted.aes_gcm_nonce_b64u)?;
    if nonce.len() != AES_NONCE_SIZE {
        return Err(VrfWorkerError::InvalidEncoding(format!(
            "nonce must be {} bytes, got {}",
            AES_NONCE_SIZE,
            nonce.len()
        )));
    }

    let key = derive_aes_key(prf)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| VrfWorkerError::Decryption(e.to_string()))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| VrfWorkerError::Decryption("wrong key or corrupted keypair".to_string()))?,
    );
    signing_key_from_bytes(&plaintext)
}

fn signing_key_from_bytes(bytes: &[u8]) -> Result<SigningKey, VrfWorkerError> {
    let secret: Zeroizing<[u8; VRF_SECRET_SIZE]> = Zeroizing::new(
        bytes
            .try_into()
            .map_err(|_| VrfWorkerError::Decryption(format!("keypair must be {} bytes", VRF_SECRET_SIZE)))?,
    );
    Ok(SigningKey::from_bytes(&secret))
}

/// Hash of the domain-separated challenge inputs
pub fn vrf_input_hash(input: &VrfInputData, block_hash: &[u8], timestamp: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(VRF_DOMAIN_SEPARATOR);
    hasher.update(input.user_id.as_bytes());
    hasher.update(input.rp_id.as_bytes());
    hasher.update(input.block_height.to_le_bytes());
    hasher.update(block_hash);
    hasher.update(timestamp.to_le_bytes());
    hasher.finalize().into()
}

/// Signing grant minted against the active VRF session
#[derive(Debug, Clone)]
struct SigningGrant {
    account_id: String,
    expires_at_ms: u64,
}

pub struct VrfKeyManager {
    keypair: Option<SigningKey>,
    account_id: Option<String>,
    session_started_ms: u64,
    last_challenge: Option<VrfChallenge>,
    signing_grants: HashMap<String, SigningGrant>,
    clock: Arc<dyn Clock>,
}

impl VrfKeyManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keypair: None,
            account_id: None,
            session_started_ms: 0,
            last_challenge: None,
            signing_grants: HashMap::new(),
            clock,
        }
    }

    pub fn is_active(&self) -> bool {
        self.keypair.is_some() && self.account_id.is_some()
    }

    pub fn public_key_b64u(&self) -> Option<String> {
        self.keypair
            .as_ref()
            .map(|k| b64u_encode(k.verifying_key().as_bytes()))
    }

    fn install(&mut self, account_id: &str, keypair: SigningKey) {
        // Replacing the slot drops (and zeroizes) the previous keypair.
        self.keypair = Some(keypair);
        self.account_id = Some(account_id.to_string());
        self.session_started_ms = self.clock.now_ms();
        self.last_challenge = None;
        self.signing_grants.clear();
    }

    fn active_keypair(&self) -> Result<&SigningKey, VrfWorkerError> {
        self.keypair.as_ref().ok_or(VrfWorkerError::NotActive)
    }

    fn require_account(&self, account_id: &str) -> Result<(), VrfWorkerError> {
        match self.account_id.as_deref() {
            Some(active) if active == account_id => Ok(()),
            Some(active) => Err(VrfWorkerError::AccountMismatch {
                active: active.to_string(),
                requested: account_id.to_string(),
            }),
            None => Err(VrfWorkerError::NotActive),
        }
    }

    /// Fresh random keypair for registration, optionally with a first challenge
    pub fn generate_bootstrap_keypair(
        &mut self,
        account_id: &str,
        input: Option<VrfInputData>,
    ) -> Result<BootstrapResponse, VrfWorkerError> {
        let keypair = SigningKey::generate(&mut OsRng);
        self.install(account_id, keypair);
        log_session_event("vrf_keypair_bootstrapped", account_id, serde_json::json!({}));

        let vrf_public_key = self.public_key_b64u().unwrap_or_default();
        let vrf_challenge = match input {
            Some(input) => Some(self.generate_vrf_challenge(input)?),
            None => None,
        };
        Ok(BootstrapResponse {
            vrf_public_key,
            vrf_challenge,
        })
    }

    /// Encrypt the in-memory keypair after checking it is the one the caller expects
    pub fn encrypt_current_keypair_with_prf(
        &self,
        expected_public_key: &str,
        prf: &[u8],
    ) -> Result<EncryptWithPrfResponse, VrfWorkerError> {
        let keypair = self.keypair.as_ref().ok_or(VrfWorkerError::NoKeypair)?;
        let actual = b64u_encode(keypair.verifying_key().as_bytes());
        if actual != expected_public_key {
            return Err(VrfWorkerError::PublicKeyMismatch {
                expected: expected_public_key.to_string(),
                actual,
            });
        }

        Ok(EncryptWithPrfResponse {
            vrf_public_key: actual,
            encrypted_vrf_keypair: encrypt_keypair(keypair, prf)?,
        })
    }

    pub fn unlock_vrf_keypair(
        &mut self,
        account_id: &str,
        encrypted: &EncryptedVrfKeypair,
        prf: &[u8],
    ) -> Result<UnlockResponse, VrfWorkerError> {
        // A failed unlock leaves no keypair behind.
        self.logout();
        let keypair = decrypt_keypair(encrypted, prf)?;
        self.install(account_id, keypair);
        log_session_event("vrf_unlocked", account_id, serde_json::json!({"path": "prf"}));

        Ok(UnlockResponse {
            account_id: account_id.to_string(),
            vrf_public_key: self.public_key_b64u().unwrap_or_default(),
        })
    }

    /// Install raw secret bytes recovered through escrow
    pub fn load_plaintext_keypair(
        &mut self,
        account_id: &str,
        secret: &[u8],
    ) -> Result<UnlockResponse, VrfWorkerError> {
        self.logout();
        let keypair = signing_key_from_bytes(secret)?;
        self.install(account_id, keypair);
        log_session_event("vrf_unlocked", account_id, serde_json::json!({"path": "escrow"}));

        Ok(UnlockResponse {
            account_id: account_id.to_string(),
            vrf_public_key: self.public_key_b64u().unwrap_or_default(),
        })
    }

    /// Secret bytes for escrow encryption; stays inside the worker
    pub(crate) fn keypair_secret(&self) -> Result<Zeroizing<Vec<u8>>, VrfWorkerError> {
        let keypair = self.keypair.as_ref().ok_or(VrfWorkerError::NoKeypair)?;
        Ok(Zeroizing::new(keypair.to_bytes().to_vec()))
    }

    pub fn generate_vrf_challenge(
        &mut self,
        input: VrfInputData,
    ) -> Result<VrfChallenge, VrfWorkerError> {
        let keypair = self.active_keypair()?;
        self.require_account(&input.user_id)?;

        let block_hash = b64u_decode(&input.block_hash)?;
        let timestamp = input.timestamp.unwrap_or_else(|| self.clock.now_ms());
        let vrf_input = vrf_input_hash(&input, &block_hash, timestamp);

        let proof = keypair.sign(&vrf_input).to_bytes();
        let vrf_output = Sha256::digest(proof);

        let challenge = VrfChallenge {
            vrf_input: b64u_encode(&vrf_input),
            vrf_output: b64u_encode(&vrf_output),
            vrf_proof: b64u_encode(&proof),
            vrf_public_key: b64u_encode(keypair.verifying_key().as_bytes()),
            user_id: input.user_id,
            rp_id: input.rp_id,
            block_height: input.block_height,
            block_hash: input.block_hash,
        };
        self.last_challenge = Some(challenge.clone());
        Ok(challenge)
    }

    /// Grant a warm signing session bound to the last VRF challenge
    pub fn mint_signing_session(
        &mut self,
        request: &MintRequest,
    ) -> Result<MintResponse, VrfWorkerError> {
        self.active_keypair()?;
        self.require_account(&request.account_id)?;

        if request.remaining_uses == 0 || request.ttl_ms == 0 {
            return Err(VrfWorkerError::InvalidSession(
                "remainingUses and ttlMs must be positive".to_string(),
            ));
        }
        let now = self.clock.now_ms();
        let expires_at_ms = now.checked_add(request.ttl_ms).ok_or_else(|| {
            VrfWorkerError::InvalidSession(format!("ttlMs {} out of range", request.ttl_ms))
        })?;

        let expected = self
            .last_challenge
            .as_ref()
            .map(|c| c.vrf_output.as_str())
            .ok_or(VrfWorkerError::ChallengeMismatch)?;
        if request.credential.challenge_b64u.as_deref() != Some(expected) {
            return Err(VrfWorkerError::ChallengeMismatch);
        }
        request.credential.prf_bytes()?;

        // Each challenge mints at most one session.
        self.last_challenge = None;

        self.signing_grants
            .retain(|_, grant| grant.expires_at_ms >= now);

        let session_id = uuid::Uuid::new_v4().to_string();
        self.signing_grants.insert(
            session_id.clone(),
            SigningGrant {
                account_id: request.account_id.clone(),
                expires_at_ms,
            },
        );

        log_session_event(
            "signing_session_minted",
            &request.account_id,
            serde_json::json!({
                "sessionId": session_id,
                "remainingUses": request.remaining_uses,
                "expiresAtMs": expires_at_ms,
            }),
        );

        Ok(MintResponse {
            session_id,
            account_id: request.account_id.clone(),
            remaining_uses: request.remaining_uses,
            expires_at_ms,
        })
    }

    pub fn status(&self) -> VrfStatus {
        let now = self.clock.now_ms();
        VrfStatus {
            active: self.is_active(),
            account_id: self.account_id.clone(),
            vrf_public_key: self.public_key_b64u(),
            session_duration_ms: if self.is_active() {
                now.saturating_sub(self.session_started_ms)
            } else {
                0
            },
            signing_sessions: self
                .signing_grants
                .values()
                .filter(|g| g.expires_at_ms >= now && Some(&g.account_id) == self.account_id.as_ref())
                .count(),
        }
    }

    /// Drop the keypair and everything minted from it; returns whether one was held
    pub fn logout(&mut self) -> bool {
        let had_keypair = self.keypair.take().is_some();
        self.account_id = None;
        self.session_started_ms = 0;
        self.last_challenge = None;
        self.signing_grants.clear();
        had_keypair
    }
}
