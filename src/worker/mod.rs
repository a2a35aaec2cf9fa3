//! In-process VRF worker
//!
//! The isolated context that owns VRF key material. It runs as a tokio task
//! that receives [`WorkerRequest`]s over an mpsc channel, handles them one
//! at a time, and posts each [`WorkerResponse`] back through the shared
//! [`ResponseRouter`]. The page side only ever holds the [`WorkerChannel`].

pub mod escrow_client;
pub mod manager;
pub mod messages;

pub use escrow_client::{EscrowClient, HttpEscrowClient};
pub use manager::VrfKeyManager;
pub use messages::*;

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::channel::{
    error_codes, guard, ChannelError, ResponseRouter, WorkerChannel, WorkerRequest,
    WorkerRequestType, WorkerResponse,
};
use crate::clock::{self, Clock};
use crate::error::ErrorKind;
use crate::escrow::{EscrowError, ServerLocked, Shamir3Pass};
use crate::logging::log_security_event;

/// Errors raised while handling a worker request
#[derive(Debug, Error)]
pub enum VrfWorkerError {
    #[error("no VRF keypair in memory")]
    NoKeypair,

    #[error("VRF session not active")]
    NotActive,

    #[error("active account {active} does not match {requested}")]
    AccountMismatch { active: String, requested: String },

    #[error("public key mismatch: expected {expected}, found {actual}")]
    PublicKeyMismatch { expected: String, actual: String },

    #[error("credential challenge does not match the last VRF output")]
    ChallengeMismatch,

    #[error("credential carries no PRF output")]
    MissingPrf,

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid signing session request: {0}")]
    InvalidSession(String),

    #[error("escrow relay not configured")]
    EscrowNotConfigured,

    #[error("escrow: {0}")]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl VrfWorkerError {
    /// Code carried in the `status: error` response
    pub fn code(&self) -> &'static str {
        match self {
            VrfWorkerError::NoKeypair | VrfWorkerError::NotActive => error_codes::VRF_NOT_ACTIVE,
            VrfWorkerError::AccountMismatch { .. } | VrfWorkerError::PublicKeyMismatch { .. } => {
                error_codes::ACCOUNT_MISMATCH
            }
            VrfWorkerError::ChallengeMismatch => error_codes::CHALLENGE_MISMATCH,
            VrfWorkerError::MissingPrf
            | VrfWorkerError::InvalidEncoding(_)
            | VrfWorkerError::InvalidSession(_) => error_codes::MALFORMED_REQUEST,
            VrfWorkerError::Decryption(_) => error_codes::DECRYPTION_FAILED,
            VrfWorkerError::KeyDerivation | VrfWorkerError::Encryption(_) => error_codes::INTERNAL,
            VrfWorkerError::EscrowNotConfigured => error_codes::ESCROW_DISABLED,
            VrfWorkerError::Escrow(EscrowError::Decryption(_)) => error_codes::DECRYPTION_FAILED,
            VrfWorkerError::Escrow(e) => match e.kind() {
                ErrorKind::EscrowDisabled => error_codes::ESCROW_DISABLED,
                ErrorKind::Transport => error_codes::ESCROW_TRANSPORT,
                _ => error_codes::ESCROW_FAILED,
            },
            VrfWorkerError::Channel(ChannelError::ForbiddenField { .. }) => {
                error_codes::FORBIDDEN_FIELD
            }
            VrfWorkerError::Channel(_) => error_codes::MALFORMED_REQUEST,
        }
    }
}

/// What the worker is wired to at spawn time
#[derive(Clone)]
pub struct WorkerConfig {
    pub shamir: Shamir3Pass,
    pub escrow: Option<Arc<dyn EscrowClient>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shamir: Shamir3Pass::default(),
            escrow: None,
            clock: clock::system(),
        }
    }
}

impl WorkerConfig {
    pub fn with_escrow(mut self, escrow: Arc<dyn EscrowClient>) -> Self {
        self.escrow = Some(escrow);
        self
    }

    /// Modulus must match the relay's
    pub fn with_shamir(mut self, shamir: Shamir3Pass) -> Self {
        self.shamir = shamir;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Worker actor state
pub struct VrfWorker {
    manager: VrfKeyManager,
    shamir: Shamir3Pass,
    escrow: Option<Arc<dyn EscrowClient>>,
    clock: Arc<dyn Clock>,
    router: ResponseRouter,
}

fn to_data<T: Serialize>(value: T) -> Result<Value, VrfWorkerError> {
    serde_json::to_value(value)
        .map_err(|e| VrfWorkerError::Channel(ChannelError::InvalidResponse(e.to_string())))
}

impl VrfWorker {
    pub fn new(config: WorkerConfig, router: ResponseRouter) -> Self {
        Self {
            manager: VrfKeyManager::new(config.clock.clone()),
            shamir: config.shamir,
            escrow: config.escrow,
            clock: config.clock,
            router,
        }
    }

    /// Process requests until every sender is gone
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<WorkerRequest>) {
        while let Some(request) = inbox.recv().await {
            let response = self.handle(request).await;
            self.router.deliver(response);
        }
        self.manager.logout();
        tracing::debug!("VRF worker stopped");
    }

    /// Handle one request; always produces a terminal response
    pub async fn handle(&mut self, request: WorkerRequest) -> WorkerResponse {
        let request_id = request.request_id.clone();

        if let Some(path) = guard::find_forbidden_field(&request.payload) {
            log_security_event(
                "worker_forbidden_field",
                false,
                serde_json::json!({"path": path, "type": request.request_type.name()}),
                Some(&request_id),
            );
            let err = VrfWorkerError::Channel(ChannelError::ForbiddenField { path });
            return WorkerResponse::failure(request_id, err.code(), err.to_string());
        }

        match self.dispatch(&request).await {
            Ok(data) => WorkerResponse::success(request_id, data),
            Err(err) => {
                tracing::warn!(
                    request_id = %request_id,
                    request_type = %request.request_type,
                    code = err.code(),
                    error = %err,
                    "VRF worker request failed"
                );
                WorkerResponse::failure(request_id, err.code(), err.to_string())
            }
        }
    }

    async fn dispatch(&mut self, request: &WorkerRequest) -> Result<Value, VrfWorkerError> {
        match request.request_type {
            WorkerRequestType::Ping => to_data(PingResponse {
                alive: true,
                timestamp: self.clock.now_ms(),
            }),
            WorkerRequestType::GenerateVrfKeypairBootstrap => {
                let req: BootstrapRequest = request.parse_payload()?;
                to_data(
                    self.manager
                        .generate_bootstrap_keypair(&req.account_id, req.vrf_input_params)?,
                )
            }
            WorkerRequestType::EncryptVrfKeypairWithPrf => {
                let req: EncryptWithPrfRequest = request.parse_payload()?;
                let prf = Zeroizing::new(req.credential.prf_bytes()?);
                to_data(
                    self.manager
                        .encrypt_current_keypair_with_prf(&req.expected_public_key, &prf)?,
                )
            }
            WorkerRequestType::UnlockVrfKeypair => {
                let req: UnlockRequest = request.parse_payload()?;
                let prf = Zeroizing::new(req.credential.prf_bytes()?);
                to_data(self.manager.unlock_vrf_keypair(
                    &req.account_id,
                    &req.encrypted_vrf_keypair,
                    &prf,
                )?)
            }
            WorkerRequestType::Shamir3passClientEncryptCurrentVrfKeypair => {
                to_data(self.shamir_encrypt_current(&request.request_id).await?)
            }
            WorkerRequestType::Shamir3passClientDecryptVrfKeypair => {
                let req: ShamirDecryptRequest = request.parse_payload()?;
                to_data(self.shamir_decrypt(&request.request_id, req).await?)
            }
            WorkerRequestType::GenerateVrfChallenge => {
                let req: ChallengeRequest = request.parse_payload()?;
                to_data(self.manager.generate_vrf_challenge(req.vrf_input_params)?)
            }
            WorkerRequestType::MintSigningSession => {
                let req: MintRequest = request.parse_payload()?;
                to_data(self.manager.mint_signing_session(&req)?)
            }
            WorkerRequestType::CheckVrfStatus => to_data(self.manager.status()),
            WorkerRequestType::Logout => to_data(LogoutResponse {
                logged_out: self.manager.logout(),
            }),
        }
    }

    fn escrow(&self) -> Result<Arc<dyn EscrowClient>, VrfWorkerError> {
        self.escrow.clone().ok_or(VrfWorkerError::EscrowNotConfigured)
    }

    fn progress(&self, request_id: &str, step: &str, message: &str) {
        self.router
            .deliver(WorkerResponse::progress(request_id, step, message));
    }

    /// Encrypt the in-memory keypair under a fresh KEK and leave only `kek_s` at rest
    async fn shamir_encrypt_current(
        &mut self,
        request_id: &str,
    ) -> Result<ShamirEncryptResponse, VrfWorkerError> {
        let escrow = self.escrow()?;
        let vrf_public_key = self
            .manager
            .public_key_b64u()
            .ok_or(VrfWorkerError::NoKeypair)?;

        let secret = self.manager.keypair_secret()?;
        let (ciphertext, kek) = self.shamir.encrypt_with_random_kek(&secret)?;
        let client_keys = self.shamir.generate_lock_keys()?;
        let kek_c = self.shamir.lock_kek(&kek, &client_keys);

        self.progress(request_id, "escrow_apply_lock", "requesting server lock");
        let (kek_cs, key_id) = escrow.apply_server_lock(&kek_c).await?;
        let kek_s = self.shamir.remove_client_lock(&kek_cs, &client_keys);

        Ok(ShamirEncryptResponse {
            vrf_public_key,
            server_encrypted_vrf_keypair: ServerEncryptedVrfKeypair {
                ciphertext_vrf_b64u: b64u_encode(&ciphertext),
                kek_s_b64u: kek_s.to_b64u(),
                server_key_id: Some(key_id),
            },
        })
    }

    /// Re-lock `kek_s` with a one-time client key, have the relay strip its lock, decrypt
    async fn shamir_decrypt(
        &mut self,
        request_id: &str,
        request: ShamirDecryptRequest,
    ) -> Result<UnlockResponse, VrfWorkerError> {
        let escrow = self.escrow()?;
        let record = &request.server_encrypted_vrf_keypair;
        let kek_s = ServerLocked::from_b64u(&record.kek_s_b64u)?;
        let ciphertext = b64u_decode(&record.ciphertext_vrf_b64u)?;

        let client_keys = self.shamir.generate_lock_keys()?;
        let kek_cs = self.shamir.relock_server_locked(&kek_s, &client_keys);

        self.progress(request_id, "escrow_remove_lock", "requesting server unlock");
        let kek_c = escrow
            .remove_server_lock(&kek_cs, record.server_key_id.as_deref())
            .await?;
        let kek = self.shamir.unlock_kek(&kek_c, &client_keys);
        let secret = Zeroizing::new(self.shamir.decrypt_with_kek(&ciphertext, &kek)?);

        self.manager
            .load_plaintext_keypair(&request.account_id, &secret)
    }
}

/// Start a worker task and return the page-side channel to it
///
/// The task exits once every clone of the returned channel is dropped.
pub fn spawn_vrf_worker(config: WorkerConfig) -> WorkerChannel {
    let (tx, rx) = mpsc::unbounded_channel();
    let router = ResponseRouter::default();
    let worker = VrfWorker::new(config, router.clone());
    tokio::spawn(worker.run(rx));
    WorkerChannel::with_router(Arc::new(tx), router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SendOptions;
    use crate::clock::ManualClock;
    use crate::escrow::{ServerKeyMaterial, ShamirEscrowService};
    use num_bigint::BigUint;

    const PRF: [u8; 32] = [3u8; 32];

    fn small_group() -> Shamir3Pass {
        // 2^127 - 1
        Shamir3Pass::new((BigUint::from(1u8) << 127) - BigUint::from(1u8)).unwrap()
    }

    fn escrow_service(shamir: &Shamir3Pass, clock: &ManualClock) -> Arc<ShamirEscrowService> {
        let keypair = shamir.generate_lock_keys().unwrap().into();
        Arc::new(ShamirEscrowService::new(
            shamir.clone(),
            Some(ServerKeyMaterial::from_keypair(None, keypair)),
            Arc::new(clock.clone()),
        ))
    }

    fn credential(challenge: Option<String>) -> CredentialPayload {
        CredentialPayload {
            id: "cred-1".to_string(),
            challenge_b64u: challenge,
            prf: PrfResults {
                first: b64u_encode(&PRF),
            },
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        channel: &WorkerChannel,
        request_type: WorkerRequestType,
        payload: Value,
    ) -> Result<T, ChannelError> {
        channel
            .request(request_type, payload, SendOptions::default())
            .await
    }

    #[tokio::test]
    async fn test_ping() {
        let channel = spawn_vrf_worker(WorkerConfig::default());
        let pong: PingResponse = call(&channel, WorkerRequestType::Ping, Value::Null)
            .await
            .unwrap();
        assert!(pong.alive);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_register_then_unlock_roundtrip() {
        let channel = spawn_vrf_worker(WorkerConfig::default());

        let boot: BootstrapResponse = call(
            &channel,
            WorkerRequestType::GenerateVrfKeypairBootstrap,
            serde_json::json!({"accountId": "alice.near"}),
        )
        .await
        .unwrap();

        let encrypted: EncryptWithPrfResponse = call(
            &channel,
            WorkerRequestType::EncryptVrfKeypairWithPrf,
            serde_json::to_value(EncryptWithPrfRequest {
                expected_public_key: boot.vrf_public_key.clone(),
                credential: credential(None),
            })
            .unwrap(),
        )
        .await
        .unwrap();

        let _: LogoutResponse = call(&channel, WorkerRequestType::Logout, Value::Null)
            .await
            .unwrap();

        let unlocked: UnlockResponse = call(
            &channel,
            WorkerRequestType::UnlockVrfKeypair,
            serde_json::to_value(UnlockRequest {
                account_id: "alice.near".to_string(),
                encrypted_vrf_keypair: encrypted.encrypted_vrf_keypair,
                credential: credential(None),
            })
            .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(unlocked.vrf_public_key, boot.vrf_public_key);

        let status: VrfStatus = call(&channel, WorkerRequestType::CheckVrfStatus, Value::Null)
            .await
            .unwrap();
        assert!(status.active);
        assert_eq!(status.account_id.as_deref(), Some("alice.near"));
    }

    #[tokio::test]
    async fn test_worker_rejects_forbidden_field_on_receipt() {
        let router = ResponseRouter::default();
        let mut worker = VrfWorker::new(WorkerConfig::default(), router);
        let request = WorkerRequest::new(
            WorkerRequestType::UnlockVrfKeypair,
            serde_json::json!({"accountId": "alice.near", "prfOutput": "AA"}),
        );

        let response = worker.handle(request).await;
        let err = response.into_result().unwrap_err();
        assert_eq!(err.worker_code(), Some(error_codes::FORBIDDEN_FIELD));
    }

    #[tokio::test]
    async fn test_challenge_without_session_fails() {
        let channel = spawn_vrf_worker(WorkerConfig::default());
        let err = call::<VrfChallenge>(
            &channel,
            WorkerRequestType::GenerateVrfChallenge,
            serde_json::json!({
                "vrfInputParams": {
                    "userId": "alice.near",
                    "rpId": "wallet.example",
                    "blockHeight": 1,
                    "blockHash": "AA"
                }
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.worker_code(), Some(error_codes::VRF_NOT_ACTIVE));
    }

    #[tokio::test]
    async fn test_shamir_escrow_roundtrip_with_progress() {
        let clock = ManualClock::new(0);
        let shamir = small_group();
        let service = escrow_service(&shamir, &clock);
        let channel = spawn_vrf_worker(
            WorkerConfig::default()
                .with_shamir(shamir)
                .with_escrow(service)
                .with_clock(Arc::new(clock.clone())),
        );

        let boot: BootstrapResponse = call(
            &channel,
            WorkerRequestType::GenerateVrfKeypairBootstrap,
            serde_json::json!({"accountId": "alice.near"}),
        )
        .await
        .unwrap();

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let escrowed: ShamirEncryptResponse = channel
            .request(
                WorkerRequestType::Shamir3passClientEncryptCurrentVrfKeypair,
                serde_json::json!({}),
                SendOptions::default().with_progress(progress_tx),
            )
            .await
            .unwrap();
        assert_eq!(escrowed.vrf_public_key, boot.vrf_public_key);
        let step = progress_rx.try_recv().unwrap();
        assert_eq!(step.data.unwrap()["step"], "escrow_apply_lock");

        let _: LogoutResponse = call(&channel, WorkerRequestType::Logout, Value::Null)
            .await
            .unwrap();

        let unlocked: UnlockResponse = call(
            &channel,
            WorkerRequestType::Shamir3passClientDecryptVrfKeypair,
            serde_json::to_value(ShamirDecryptRequest {
                account_id: "alice.near".to_string(),
                server_encrypted_vrf_keypair: escrowed.server_encrypted_vrf_keypair,
            })
            .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(unlocked.vrf_public_key, boot.vrf_public_key);
    }

    #[tokio::test]
    async fn test_shamir_without_relay_is_disabled() {
        let channel = spawn_vrf_worker(WorkerConfig::default());
        let _: BootstrapResponse = call(
            &channel,
            WorkerRequestType::GenerateVrfKeypairBootstrap,
            serde_json::json!({"accountId": "alice.near"}),
        )
        .await
        .unwrap();

        let err = call::<ShamirEncryptResponse>(
            &channel,
            WorkerRequestType::Shamir3passClientEncryptCurrentVrfKeypair,
            serde_json::json!({}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.worker_code(), Some(error_codes::ESCROW_DISABLED));
        assert_eq!(err.kind(), ErrorKind::EscrowDisabled);
    }

    #[tokio::test]
    async fn test_relay_without_e_s_surfaces_disabled() {
        let clock = ManualClock::new(0);
        let shamir = small_group();
        let service = Arc::new(ShamirEscrowService::disabled(
            shamir.clone(),
            Arc::new(clock.clone()),
        ));
        let channel = spawn_vrf_worker(
            WorkerConfig::default()
                .with_shamir(shamir)
                .with_escrow(service),
        );
        let _: BootstrapResponse = call(
            &channel,
            WorkerRequestType::GenerateVrfKeypairBootstrap,
            serde_json::json!({"accountId": "alice.near"}),
        )
        .await
        .unwrap();

        let err = call::<ShamirEncryptResponse>(
            &channel,
            WorkerRequestType::Shamir3passClientEncryptCurrentVrfKeypair,
            serde_json::json!({}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.worker_code(), Some(error_codes::ESCROW_DISABLED));
    }
}
