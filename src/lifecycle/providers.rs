//! External collaborators of the orchestrator.
//!
//! The WebAuthn ceremony, the chain RPC, and the browser-side key storage
//! all live outside this crate; they are reached through these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::ErrorKind;
use crate::worker::{
    b64u_encode, CredentialPayload, EncryptedVrfKeypair, PrfResults, ServerEncryptedVrfKeypair,
};

/// Biometric ceremony outcome other than success
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CeremonyError {
    #[error("ceremony cancelled by user")]
    Cancelled,

    #[error("ceremony failed: {0}")]
    Failed(String),
}

impl CeremonyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CeremonyError::Cancelled => ErrorKind::UserCancelled,
            CeremonyError::Failed(_) => ErrorKind::Internal,
        }
    }
}

/// Assertion returned by a successful ceremony
#[derive(Clone)]
pub struct Credential {
    pub id: String,
    /// Challenge the authenticator signed (base64url)
    pub challenge_b64u: String,
    /// First PRF extension output (base64url)
    pub prf_first_b64u: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("challenge_b64u", &self.challenge_b64u)
            .finish_non_exhaustive()
    }
}

impl From<&Credential> for CredentialPayload {
    fn from(credential: &Credential) -> Self {
        CredentialPayload {
            id: credential.id.clone(),
            challenge_b64u: Some(credential.challenge_b64u.clone()),
            prf: PrfResults {
                first: credential.prf_first_b64u.clone(),
            },
        }
    }
}

#[async_trait]
pub trait BiometricProvider: Send + Sync {
    /// Run a WebAuthn ceremony for `account_id` over `challenge`
    async fn authenticate(&self, account_id: &str, challenge: &[u8])
        -> Result<Credential, CeremonyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chain client error: {0}")]
pub struct ChainError(pub String);

/// Latest block, bound into VRF challenges for freshness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    pub height: u64,
    pub hash: Vec<u8>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_context(&self) -> Result<BlockContext, ChainError>;
}

/// Chain client that always reports the same block
#[derive(Debug, Clone)]
pub struct FixedChainClient {
    context: BlockContext,
}

impl FixedChainClient {
    pub fn new(height: u64, hash: Vec<u8>) -> Self {
        Self {
            context: BlockContext { height, hash },
        }
    }
}

#[async_trait]
impl ChainClient for FixedChainClient {
    async fn block_context(&self) -> Result<BlockContext, ChainError> {
        Ok(self.context.clone())
    }
}

/// What the client persists per account and device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVrfKeypair {
    pub account_id: String,
    pub device_number: u32,
    pub vrf_public_key: String,
    pub encrypted_vrf_keypair: EncryptedVrfKeypair,
    /// Present when the keypair is also escrowed with the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_encrypted_vrf_keypair: Option<ServerEncryptedVrfKeypair>,
    pub created_at_ms: u64,
}

impl StoredVrfKeypair {
    pub fn is_server_assisted(&self) -> bool {
        self.server_encrypted_vrf_keypair.is_some()
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait VrfKeyStore: Send + Sync {
    async fn get(
        &self,
        account_id: &str,
        device_number: u32,
    ) -> Result<Option<StoredVrfKeypair>, KeyStoreError>;

    async fn put(&self, record: StoredVrfKeypair) -> Result<(), KeyStoreError>;

    /// Returns whether a record was removed
    async fn remove(&self, account_id: &str, device_number: u32) -> Result<bool, KeyStoreError>;
}

/// In-memory key store
#[derive(Default)]
pub struct MemoryVrfKeyStore {
    records: RwLock<HashMap<(String, u32), StoredVrfKeypair>>,
}

impl MemoryVrfKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VrfKeyStore for MemoryVrfKeyStore {
    async fn get(
        &self,
        account_id: &str,
        device_number: u32,
    ) -> Result<Option<StoredVrfKeypair>, KeyStoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&(account_id.to_string(), device_number))
            .cloned())
    }

    async fn put(&self, record: StoredVrfKeypair) -> Result<(), KeyStoreError> {
        let key = (record.account_id.clone(), record.device_number);
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn remove(&self, account_id: &str, device_number: u32) -> Result<bool, KeyStoreError> {
        Ok(self
            .records
            .write()
            .await
            .remove(&(account_id.to_string(), device_number))
            .is_some())
    }
}

/// Challenge encoding shared by the orchestrator and ceremony providers
pub fn challenge_b64u(challenge: &[u8]) -> String {
    b64u_encode(challenge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(account: &str, device: u32) -> StoredVrfKeypair {
        StoredVrfKeypair {
            account_id: account.to_string(),
            device_number: device,
            vrf_public_key: "pk".to_string(),
            encrypted_vrf_keypair: EncryptedVrfKeypair {
                encrypted_vrf_data_b64u: "AA".to_string(),
                aes_gcm_nonce_b64u: "AA".to_string(),
            },
            server_encrypted_vrf_keypair: None,
            created_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_memory_key_store_by_device() {
        let store = MemoryVrfKeyStore::new();
        store.put(record("alice.near", 1)).await.unwrap();
        store.put(record("alice.near", 2)).await.unwrap();

        assert!(store.get("alice.near", 1).await.unwrap().is_some());
        assert!(store.get("alice.near", 3).await.unwrap().is_none());
        assert!(store.remove("alice.near", 2).await.unwrap());
        assert!(store.get("alice.near", 2).await.unwrap().is_none());
    }

    #[test]
    fn test_credential_debug_hides_prf() {
        let credential = Credential {
            id: "cred".to_string(),
            challenge_b64u: "AA".to_string(),
            prf_first_b64u: "c2VjcmV0".to_string(),
        };
        assert!(!format!("{:?}", credential).contains("c2VjcmV0"));

        let payload = CredentialPayload::from(&credential);
        assert_eq!(payload.prf.first, "c2VjcmV0");
    }
}
