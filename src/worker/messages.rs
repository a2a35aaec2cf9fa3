//! Typed payloads and results for VRF worker requests.
//!
//! Binary values travel as unpadded base64url strings.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use super::VrfWorkerError;

pub fn b64u_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64u_decode(encoded: &str) -> Result<Vec<u8>, VrfWorkerError> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|e| VrfWorkerError::InvalidEncoding(e.to_string()))
}

/// WebAuthn PRF extension results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrfResults {
    /// First PRF output (base64url)
    pub first: String,
}

/// The parts of a WebAuthn assertion the worker consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPayload {
    pub id: String,
    /// Challenge the authenticator signed over (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_b64u: Option<String>,
    pub prf: PrfResults,
}

impl CredentialPayload {
    /// PRF bytes; empty output is rejected
    pub fn prf_bytes(&self) -> Result<Vec<u8>, VrfWorkerError> {
        let bytes = b64u_decode(&self.prf.first)?;
        if bytes.is_empty() {
            return Err(VrfWorkerError::MissingPrf);
        }
        Ok(bytes)
    }
}

/// VRF keypair encrypted under the PRF-derived AES key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedVrfKeypair {
    pub encrypted_vrf_data_b64u: String,
    pub aes_gcm_nonce_b64u: String,
}

/// VRF keypair encrypted under a KEK that only the relay can help recover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEncryptedVrfKeypair {
    /// `nonce || ciphertext` under the KEK
    pub ciphertext_vrf_b64u: String,
    /// KEK under the server lock only
    pub kek_s_b64u: String,
    /// Server key that holds the lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_key_id: Option<String>,
}

/// Inputs bound into a VRF challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrfInputData {
    pub user_id: String,
    pub rp_id: String,
    pub block_height: u64,
    /// Block hash (base64url)
    pub block_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrfChallenge {
    pub vrf_input: String,
    /// Used as the WebAuthn challenge
    pub vrf_output: String,
    pub vrf_proof: String,
    pub vrf_public_key: String,
    pub user_id: String,
    pub rp_id: String,
    pub block_height: u64,
    pub block_hash: String,
}

// -- Request payloads ---------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_input_params: Option<VrfInputData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptWithPrfRequest {
    pub expected_public_key: String,
    pub credential: CredentialPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockRequest {
    pub account_id: String,
    pub encrypted_vrf_keypair: EncryptedVrfKeypair,
    pub credential: CredentialPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShamirDecryptRequest {
    pub account_id: String,
    pub server_encrypted_vrf_keypair: ServerEncryptedVrfKeypair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub vrf_input_params: VrfInputData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintRequest {
    pub account_id: String,
    pub credential: CredentialPayload,
    pub remaining_uses: u32,
    pub ttl_ms: u64,
}

// -- Results ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub alive: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResponse {
    pub vrf_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_challenge: Option<VrfChallenge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptWithPrfResponse {
    pub vrf_public_key: String,
    pub encrypted_vrf_keypair: EncryptedVrfKeypair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShamirEncryptResponse {
    pub vrf_public_key: String,
    pub server_encrypted_vrf_keypair: ServerEncryptedVrfKeypair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockResponse {
    pub account_id: String,
    pub vrf_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintResponse {
    pub session_id: String,
    pub account_id: String,
    pub remaining_uses: u32,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrfStatus {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_public_key: Option<String>,
    pub session_duration_ms: u64,
    pub signing_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutResponse {
    pub logged_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_prf_bytes() {
        let credential = CredentialPayload {
            id: "cred-1".to_string(),
            challenge_b64u: None,
            prf: PrfResults {
                first: b64u_encode(&[7u8; 32]),
            },
        };
        assert_eq!(credential.prf_bytes().unwrap(), vec![7u8; 32]);

        let empty = CredentialPayload {
            prf: PrfResults {
                first: String::new(),
            },
            ..credential
        };
        assert!(matches!(empty.prf_bytes(), Err(VrfWorkerError::MissingPrf)));
    }

    #[test]
    fn test_payload_field_names_pass_guard() {
        let request = UnlockRequest {
            account_id: "alice.near".to_string(),
            encrypted_vrf_keypair: EncryptedVrfKeypair {
                encrypted_vrf_data_b64u: "AA".to_string(),
                aes_gcm_nonce_b64u: "AA".to_string(),
            },
            credential: CredentialPayload {
                id: "cred-1".to_string(),
                challenge_b64u: Some("AA".to_string()),
                prf: PrfResults {
                    first: "AA".to_string(),
                },
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["encryptedVrfKeypair"]["aesGcmNonceB64u"], "AA");
        assert!(crate::channel::guard::find_forbidden_field(&json).is_none());

        let escrowed = serde_json::to_value(ServerEncryptedVrfKeypair {
            ciphertext_vrf_b64u: "AA".to_string(),
            kek_s_b64u: "AQ".to_string(),
            server_key_id: None,
        })
        .unwrap();
        assert!(crate::channel::guard::find_forbidden_field(&escrowed).is_none());
    }
}
