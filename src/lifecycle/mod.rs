//! Credential lifecycle orchestrator.
//!
//! Drives the page side of the VRF worker through login, registration,
//! signing session minting, and signing authorization. Every transition takes
//! `&mut self`, so callers serialize attempts by construction. A failure after
//! the VRF keypair is unlocked is compensated (rollback) before the error is
//! returned.

pub mod providers;
pub mod state;

pub use providers::{
    challenge_b64u, BiometricProvider, BlockContext, CeremonyError, ChainClient, ChainError,
    Credential, FixedChainClient, KeyStoreError, MemoryVrfKeyStore, StoredVrfKeypair,
    VrfKeyStore,
};
pub use state::{
    ExhaustionPolicy, LifecycleEvent, LifecycleState, LifecycleStatus, SessionEndReason,
    SigningSession, VrfSession,
};

use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::channel::{
    error_codes, AbortSignal, ChannelError, SendOptions, WorkerChannel, WorkerRequestType,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::clock::{self, Clock};
use crate::error::ErrorKind;
use crate::logging::{log_session_event, log_session_failure};
use crate::threshold::{
    ThresholdAuthorizer, ThresholdStoreError, UnauthorizedReason, AUTH_KEY_PREFIX,
};
use crate::worker::{
    b64u_decode, b64u_encode, BootstrapRequest, BootstrapResponse, ChallengeRequest,
    EncryptWithPrfRequest, EncryptWithPrfResponse, LogoutResponse, MintRequest, MintResponse,
    ShamirDecryptRequest, ShamirEncryptResponse, UnlockRequest, UnlockResponse, VrfChallenge,
    VrfInputData, VrfStatus,
};

pub const DEFAULT_SIGNING_SESSION_USES: u32 = 3;
pub const DEFAULT_SIGNING_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Relying party bound into VRF inputs
    pub rp_id: String,
    pub device_number: u32,
    pub signing_session_uses: u32,
    pub signing_session_ttl: Duration,
    pub exhaustion_policy: ExhaustionPolicy,
    /// Per-request wait on the worker channel
    pub channel_timeout: Duration,
    /// Also escrow new keypairs with the relay during registration
    pub escrow_on_register: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rp_id: "localhost".to_string(),
            device_number: 1,
            signing_session_uses: DEFAULT_SIGNING_SESSION_USES,
            signing_session_ttl: DEFAULT_SIGNING_SESSION_TTL,
            exhaustion_policy: ExhaustionPolicy::default(),
            channel_timeout: DEFAULT_REQUEST_TIMEOUT,
            escrow_on_register: true,
        }
    }
}

/// Step of the mint flow that failed
#[derive(Debug, Error)]
pub enum MintFailure {
    #[error("chain context unavailable: {0}")]
    Chain(#[from] ChainError),

    #[error("ceremony: {0}")]
    Ceremony(#[from] CeremonyError),

    #[error("worker: {0}")]
    Worker(#[from] ChannelError),
}

impl MintFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MintFailure::Chain(_) => ErrorKind::Transport,
            MintFailure::Ceremony(e) => e.kind(),
            MintFailure::Worker(e) => e.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("authentication failed: {0}")]
    Authentication(#[source] CeremonyError),

    #[error("no stored VRF keypair for {account_id} on device {device_number}")]
    NoStoredKeypair {
        account_id: String,
        device_number: u32,
    },

    #[error("VRF unlock failed: {0}")]
    VrfUnlock(#[source] ChannelError),

    #[error("signing session mint failed: {cause}")]
    MintFailed {
        #[source]
        cause: MintFailure,
    },

    #[error("no active VRF session")]
    NoActiveVrfSession,

    #[error("no active signing session")]
    NoSigningSession,

    #[error("signing session ended: {reason:?}")]
    SigningSessionEnded { reason: SessionEndReason },

    #[error("threshold authorization failed: {0}")]
    Threshold(#[source] ThresholdStoreError),

    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("worker error: {0}")]
    Channel(#[source] ChannelError),

    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("chain client error: {0}")]
    Chain(#[source] ChainError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Authentication(e) => e.kind(),
            OrchestratorError::VrfUnlock(e) | OrchestratorError::Channel(e) => e.kind(),
            OrchestratorError::MintFailed { cause } => cause.kind(),
            OrchestratorError::Threshold(e) => e.kind(),
            OrchestratorError::SigningSessionEnded { .. } => ErrorKind::AuthorizationExhausted,
            OrchestratorError::NoStoredKeypair { .. }
            | OrchestratorError::NoActiveVrfSession
            | OrchestratorError::NoSigningSession
            | OrchestratorError::InvalidTransition { .. } => ErrorKind::MalformedInput,
            OrchestratorError::Chain(_) => ErrorKind::Transport,
            OrchestratorError::KeyStore(_) => ErrorKind::Internal,
        }
    }

    /// Failures before the VRF keypair was unlocked; the caller may retry login
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Authentication(_)
                | OrchestratorError::NoStoredKeypair { .. }
                | OrchestratorError::VrfUnlock(_)
        )
    }
}

/// Result of one authorized signing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningAuthorization {
    pub session_id: String,
    pub remaining_uses: u32,
    /// Count left in the threshold store, for threshold accounts
    pub threshold_remaining_uses: Option<u32>,
}

pub struct CredentialOrchestrator {
    channel: WorkerChannel,
    biometric: Arc<dyn BiometricProvider>,
    key_store: Arc<dyn VrfKeyStore>,
    chain: Arc<dyn ChainClient>,
    threshold: Option<Arc<dyn ThresholdAuthorizer>>,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    abort: Option<AbortSignal>,
    state: LifecycleState,
    vrf_session: Option<VrfSession>,
    signing_session: Option<SigningSession>,
    /// Locks the worker when a signing session lapses under the logout policy
    expiry_watch: Option<AbortHandle>,
    events: Vec<LifecycleEvent>,
}

impl CredentialOrchestrator {
    pub fn new(
        channel: WorkerChannel,
        biometric: Arc<dyn BiometricProvider>,
        key_store: Arc<dyn VrfKeyStore>,
        chain: Arc<dyn ChainClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            channel,
            biometric,
            key_store,
            chain,
            threshold: None,
            config,
            clock: clock::system(),
            abort: None,
            state: LifecycleState::Idle,
            vrf_session: None,
            signing_session: None,
            expiry_watch: None,
            events: Vec::new(),
        }
    }

    /// Spend threshold store units on every signing attempt
    pub fn with_threshold_authorizer(mut self, authorizer: Arc<dyn ThresholdAuthorizer>) -> Self {
        self.threshold = Some(authorizer);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cancels in-flight worker requests when fired
    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    /// Current state, with a lapsed signing session already resolved by policy
    pub fn state(&self) -> LifecycleState {
        self.lapsed_state().unwrap_or(self.state)
    }

    /// Active VRF session, if any
    pub fn vrf_session(&self) -> Option<&VrfSession> {
        if self.lapsed_state() == Some(LifecycleState::Idle) {
            return None;
        }
        self.vrf_session.as_ref().filter(|s| s.active)
    }

    /// Live signing session; dead sessions read as absent
    pub fn signing_session(&self) -> Option<&SigningSession> {
        let now = self.clock.now_ms();
        self.signing_session.as_ref().filter(|s| s.is_live(now))
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    pub fn status(&self) -> LifecycleStatus {
        let account_id = self.vrf_session().map(|s| s.account_id.clone());
        LifecycleStatus {
            state: self.state(),
            vrf_active: account_id.is_some(),
            account_id,
            signing_session: self.signing_session().cloned(),
        }
    }

    /// Apply the exhaustion policy to a signing session that died unobserved
    ///
    /// Returns whether a session was ended. Every operation runs this first.
    pub async fn expire_lapsed_session(&mut self) -> Result<bool, OrchestratorError> {
        if self.state != LifecycleState::SigningSessionActive {
            return Ok(false);
        }
        let now = self.clock.now_ms();
        let reason = match &self.signing_session {
            Some(session) if session.is_exhausted() => SessionEndReason::Exhausted,
            Some(session) if session.is_expired(now) => SessionEndReason::Expired,
            _ => return Ok(false),
        };
        self.finish_signing_session(reason).await?;
        Ok(true)
    }

    // -- Login ----------------------------------------------------------------

    /// Authenticate and unlock the stored VRF keypair for `account_id`
    ///
    /// A prior VRF session is logged out first. Authentication and unlock
    /// failures leave the orchestrator in `Idle` with nothing unlocked. A
    /// cancelled or timed-out unlock may still complete inside the worker,
    /// so its keypair slot is cleared as well.
    pub async fn login(&mut self, account_id: &str) -> Result<VrfSession, OrchestratorError> {
        self.expire_lapsed_session().await?;
        if self.state.has_active_vrf() {
            self.logout().await?;
        }
        self.transition(LifecycleState::Authenticating)?;

        let record = match self
            .key_store
            .get(account_id, self.config.device_number)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.reset_to_idle();
                return Err(OrchestratorError::NoStoredKeypair {
                    account_id: account_id.to_string(),
                    device_number: self.config.device_number,
                });
            }
            Err(e) => {
                self.reset_to_idle();
                return Err(e.into());
            }
        };

        let mut challenge = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut challenge);
        let credential = match self.biometric.authenticate(account_id, &challenge).await {
            Ok(credential) => credential,
            Err(e) => {
                log_session_failure("authentication_failed", account_id, e.kind().code(), &e.to_string());
                self.reset_to_idle();
                return Err(OrchestratorError::Authentication(e));
            }
        };

        self.transition(LifecycleState::VrfUnlocking)?;
        let unlocked = match self.unlock(&record, &credential).await {
            Ok(unlocked) => unlocked,
            Err(e) => {
                log_session_failure("vrf_unlock_failed", account_id, e.kind().code(), &e.to_string());
                self.discard_worker_keypair(account_id).await;
                self.reset_to_idle();
                return Err(OrchestratorError::VrfUnlock(e));
            }
        };

        if unlocked.vrf_public_key != record.vrf_public_key {
            self.discard_worker_keypair(account_id).await;
            self.reset_to_idle();
            return Err(OrchestratorError::VrfUnlock(ChannelError::InvalidResponse(
                "unlocked VRF public key does not match the stored record".to_string(),
            )));
        }

        self.activate(account_id, unlocked.vrf_public_key, false)
    }

    async fn unlock(
        &self,
        record: &StoredVrfKeypair,
        credential: &Credential,
    ) -> Result<UnlockResponse, ChannelError> {
        if let Some(server_encrypted) = &record.server_encrypted_vrf_keypair {
            let request = ShamirDecryptRequest {
                account_id: record.account_id.clone(),
                server_encrypted_vrf_keypair: server_encrypted.clone(),
            };
            match self
                .call(WorkerRequestType::Shamir3passClientDecryptVrfKeypair, request)
                .await
            {
                Ok(unlocked) => return Ok(unlocked),
                Err(e) if is_escrow_failure(&e) => {
                    warn!(
                        account_id = %record.account_id,
                        error = %e,
                        "escrow unlock unavailable, falling back to PRF unlock"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let request = UnlockRequest {
            account_id: record.account_id.clone(),
            encrypted_vrf_keypair: record.encrypted_vrf_keypair.clone(),
            credential: credential.into(),
        };
        self.call(WorkerRequestType::UnlockVrfKeypair, request).await
    }

    /// Adopt a VRF session the worker already holds, e.g. after a page reload
    pub async fn restore_session(
        &mut self,
        account_id: &str,
    ) -> Result<VrfSession, OrchestratorError> {
        self.expire_lapsed_session().await?;
        if self.state != LifecycleState::Idle {
            return match self.vrf_session() {
                Some(session) if session.account_id == account_id => Ok(session.clone()),
                _ => Err(OrchestratorError::InvalidTransition {
                    from: self.state,
                    to: LifecycleState::VrfActive,
                }),
            };
        }

        let status: VrfStatus = self
            .call(WorkerRequestType::CheckVrfStatus, serde_json::json!({}))
            .await
            .map_err(OrchestratorError::Channel)?;

        match (status.active, status.account_id, status.vrf_public_key) {
            (true, Some(active), Some(public_key)) if active == account_id => {
                self.activate(account_id, public_key, true)
            }
            _ => Err(OrchestratorError::NoActiveVrfSession),
        }
    }

    // -- Registration ---------------------------------------------------------

    /// Create, encrypt, and persist a new VRF keypair for `account_id`
    ///
    /// The keypair stays unlocked on success. On failure the worker's keypair
    /// slot is cleared and nothing is persisted.
    pub async fn register(
        &mut self,
        account_id: &str,
    ) -> Result<StoredVrfKeypair, OrchestratorError> {
        self.expire_lapsed_session().await?;
        if self.state.has_active_vrf() {
            self.logout().await?;
        }
        self.transition(LifecycleState::Authenticating)?;

        let record = match self.create_keypair(account_id).await {
            Ok(record) => record,
            Err(e) => {
                log_session_failure("registration_failed", account_id, e.kind().code(), &e.to_string());
                self.discard_worker_keypair(account_id).await;
                self.reset_to_idle();
                return Err(e);
            }
        };

        self.transition(LifecycleState::VrfUnlocking)?;
        self.events.push(LifecycleEvent::Registered {
            account_id: account_id.to_string(),
            server_assisted: record.is_server_assisted(),
        });
        log_session_event(
            "registered",
            account_id,
            serde_json::json!({
                "device_number": record.device_number,
                "server_assisted": record.is_server_assisted(),
            }),
        );
        self.activate(account_id, record.vrf_public_key.clone(), false)?;
        Ok(record)
    }

    async fn create_keypair(
        &self,
        account_id: &str,
    ) -> Result<StoredVrfKeypair, OrchestratorError> {
        let block = self
            .chain
            .block_context()
            .await
            .map_err(OrchestratorError::Chain)?;

        let bootstrap: BootstrapResponse = self
            .call(
                WorkerRequestType::GenerateVrfKeypairBootstrap,
                BootstrapRequest {
                    account_id: account_id.to_string(),
                    vrf_input_params: Some(self.vrf_input(account_id, &block)),
                },
            )
            .await
            .map_err(OrchestratorError::Channel)?;

        let challenge = bootstrap.vrf_challenge.ok_or_else(|| {
            OrchestratorError::Channel(ChannelError::InvalidResponse(
                "bootstrap returned no VRF challenge".to_string(),
            ))
        })?;
        let challenge_bytes = decode_vrf_output(&challenge).map_err(OrchestratorError::Channel)?;

        let credential = self
            .biometric
            .authenticate(account_id, &challenge_bytes)
            .await
            .map_err(OrchestratorError::Authentication)?;

        let encrypted: EncryptWithPrfResponse = self
            .call(
                WorkerRequestType::EncryptVrfKeypairWithPrf,
                EncryptWithPrfRequest {
                    expected_public_key: bootstrap.vrf_public_key.clone(),
                    credential: (&credential).into(),
                },
            )
            .await
            .map_err(OrchestratorError::Channel)?;

        let server_encrypted_vrf_keypair = if self.config.escrow_on_register {
            match self
                .call::<ShamirEncryptResponse>(
                    WorkerRequestType::Shamir3passClientEncryptCurrentVrfKeypair,
                    serde_json::json!({}),
                )
                .await
            {
                Ok(escrowed) => Some(escrowed.server_encrypted_vrf_keypair),
                Err(e) if e.kind() == ErrorKind::EscrowDisabled => {
                    warn!(account_id = %account_id, "relay escrow disabled, storing PRF-encrypted keypair only");
                    None
                }
                Err(e) => return Err(OrchestratorError::Channel(e)),
            }
        } else {
            None
        };

        let record = StoredVrfKeypair {
            account_id: account_id.to_string(),
            device_number: self.config.device_number,
            vrf_public_key: encrypted.vrf_public_key,
            encrypted_vrf_keypair: encrypted.encrypted_vrf_keypair,
            server_encrypted_vrf_keypair,
            created_at_ms: self.clock.now_ms(),
        };
        self.key_store.put(record.clone()).await?;
        Ok(record)
    }

    // -- Signing sessions -----------------------------------------------------

    /// Mint a warm signing session bound to a fresh VRF challenge
    ///
    /// Replaces any existing signing session. Any failure rolls back the VRF
    /// session before the error is returned.
    pub async fn mint_signing_session(&mut self) -> Result<SigningSession, OrchestratorError> {
        self.expire_lapsed_session().await?;
        let account_id = match self.vrf_session() {
            Some(session) if self.state.has_active_vrf() => session.account_id.clone(),
            _ => return Err(OrchestratorError::NoActiveVrfSession),
        };
        self.transition(LifecycleState::MintingSigningSession)?;
        self.end_signing_session(SessionEndReason::Replaced);

        let minted = match self.request_signing_grant(&account_id).await {
            Ok(minted) => minted,
            Err(cause) => {
                log_session_failure("mint_failed", &account_id, cause.kind().code(), &cause.to_string());
                self.rollback(&account_id, &cause.to_string()).await;
                return Err(OrchestratorError::MintFailed { cause });
            }
        };

        let session = SigningSession {
            threshold_key: self
                .threshold
                .as_ref()
                .map(|_| format!("{}{}", AUTH_KEY_PREFIX, minted.session_id)),
            session_id: minted.session_id,
            account_id: minted.account_id,
            remaining_uses: minted.remaining_uses,
            expires_at_ms: minted.expires_at_ms,
        };
        self.signing_session = Some(session.clone());
        self.arm_expiry_watch(&session);
        self.transition(LifecycleState::SigningSessionActive)?;
        self.events.push(LifecycleEvent::SigningSessionMinted {
            session_id: session.session_id.clone(),
            remaining_uses: session.remaining_uses,
            expires_at_ms: session.expires_at_ms,
        });
        Ok(session)
    }

    async fn request_signing_grant(&self, account_id: &str) -> Result<MintResponse, MintFailure> {
        let block = self.chain.block_context().await?;

        let challenge: VrfChallenge = self
            .call(
                WorkerRequestType::GenerateVrfChallenge,
                ChallengeRequest {
                    vrf_input_params: self.vrf_input(account_id, &block),
                },
            )
            .await?;
        let challenge_bytes = decode_vrf_output(&challenge)?;

        let credential = self
            .biometric
            .authenticate(account_id, &challenge_bytes)
            .await?;

        let minted = self
            .call(
                WorkerRequestType::MintSigningSession,
                MintRequest {
                    account_id: account_id.to_string(),
                    credential: (&credential).into(),
                    remaining_uses: self.config.signing_session_uses,
                    ttl_ms: u64::try_from(self.config.signing_session_ttl.as_millis())
                        .unwrap_or(u64::MAX),
                },
            )
            .await?;
        Ok(minted)
    }

    /// Spend one use of the active signing session
    pub async fn authorize_signing(&mut self) -> Result<SigningAuthorization, OrchestratorError> {
        if self.state != LifecycleState::SigningSessionActive {
            return Err(OrchestratorError::NoSigningSession);
        }
        let now = self.clock.now_ms();
        let (session_id, account_id, threshold_key, ended) = match &self.signing_session {
            Some(session) => {
                let ended = if session.is_exhausted() {
                    Some(SessionEndReason::Exhausted)
                } else if session.is_expired(now) {
                    Some(SessionEndReason::Expired)
                } else {
                    None
                };
                (
                    session.session_id.clone(),
                    session.account_id.clone(),
                    session.threshold_key.clone(),
                    ended,
                )
            }
            None => return Err(OrchestratorError::NoSigningSession),
        };

        if let Some(reason) = ended {
            self.finish_signing_session(reason).await?;
            return Err(OrchestratorError::SigningSessionEnded { reason });
        }

        let threshold_remaining_uses = match (self.threshold.clone(), threshold_key) {
            (Some(authorizer), Some(key)) => match authorizer.consume_use(&key).await {
                Ok(remaining) => Some(remaining),
                Err(ThresholdStoreError::Unauthorized(reason)) => {
                    let end = match reason {
                        UnauthorizedReason::Expired => SessionEndReason::Expired,
                        _ => SessionEndReason::Exhausted,
                    };
                    self.finish_signing_session(end).await?;
                    return Err(OrchestratorError::Threshold(ThresholdStoreError::Unauthorized(
                        reason,
                    )));
                }
                Err(e) => {
                    self.rollback(&account_id, &e.to_string()).await;
                    return Err(OrchestratorError::Threshold(e));
                }
            },
            _ => None,
        };

        let remaining_uses = match self.signing_session.as_mut() {
            Some(session) => {
                session.remaining_uses -= 1;
                session.remaining_uses
            }
            None => return Err(OrchestratorError::NoSigningSession),
        };
        self.events.push(LifecycleEvent::SigningAuthorized {
            session_id: session_id.clone(),
            remaining_uses,
        });
        debug!(session_id = %session_id, remaining_uses, "signing authorized");

        if remaining_uses == 0 {
            self.finish_signing_session(SessionEndReason::Exhausted).await?;
        }

        Ok(SigningAuthorization {
            session_id,
            remaining_uses,
            threshold_remaining_uses,
        })
    }

    /// Drop the signing session but keep the VRF session
    pub fn clear_signing_session(&mut self) -> Result<bool, OrchestratorError> {
        let had_session = self.signing_session.is_some();
        self.end_signing_session(SessionEndReason::Cleared);
        if self.state == LifecycleState::SigningSessionActive {
            self.transition(LifecycleState::VrfActive)?;
        }
        Ok(had_session)
    }

    /// Lock the VRF keypair and forget every session
    ///
    /// Local state is cleared even when the worker cannot be reached.
    pub async fn logout(&mut self) -> Result<(), OrchestratorError> {
        let account_id = self.deactivate_vrf_session();
        self.end_signing_session(SessionEndReason::LoggedOut);
        self.reset_to_idle();
        self.events.push(LifecycleEvent::LoggedOut {
            account_id: account_id.clone(),
        });
        if let Some(account_id) = &account_id {
            log_session_event("logged_out", account_id, serde_json::json!({}));
        }

        self.channel
            .request::<LogoutResponse>(
                WorkerRequestType::Logout,
                serde_json::json!({}),
                self.compensation_options(),
            )
            .await
            .map(|_| ())
            .map_err(OrchestratorError::Channel)
    }

    // -- Internals ------------------------------------------------------------

    fn transition(&mut self, next: LifecycleState) -> Result<(), OrchestratorError> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if self.state != next {
            debug!(from = %self.state, to = %next, "lifecycle transition");
            self.events.push(LifecycleEvent::StateChanged {
                from: self.state,
                to: next,
            });
            self.state = next;
        }
        Ok(())
    }

    fn reset_to_idle(&mut self) {
        if self.state != LifecycleState::Idle {
            self.events.push(LifecycleEvent::StateChanged {
                from: self.state,
                to: LifecycleState::Idle,
            });
            self.state = LifecycleState::Idle;
        }
    }

    /// What the exhaustion policy makes of a signing session that is no longer live
    fn lapsed_state(&self) -> Option<LifecycleState> {
        if self.state != LifecycleState::SigningSessionActive {
            return None;
        }
        match &self.signing_session {
            Some(session) if !session.is_live(self.clock.now_ms()) => {
                Some(match self.config.exhaustion_policy {
                    ExhaustionPolicy::RetainVrf => LifecycleState::VrfActive,
                    ExhaustionPolicy::Logout => LifecycleState::Idle,
                })
            }
            _ => None,
        }
    }

    /// Returns the account of the session that was active
    fn deactivate_vrf_session(&mut self) -> Option<String> {
        match self.vrf_session.as_mut() {
            Some(session) if session.active => {
                session.deactivate();
                Some(session.account_id.clone())
            }
            _ => None,
        }
    }

    /// Under the logout policy, lock the worker once `session` expires even if
    /// no caller touches the orchestrator again
    fn arm_expiry_watch(&mut self, session: &SigningSession) {
        if let Some(watch) = self.expiry_watch.take() {
            watch.abort();
        }
        if self.config.exhaustion_policy != ExhaustionPolicy::Logout {
            return;
        }

        let delay = Duration::from_millis(
            session
                .expires_at_ms
                .saturating_sub(self.clock.now_ms())
                .saturating_add(1),
        );
        let channel = self.channel.clone();
        let options = self.compensation_options();
        let account_id = session.account_id.clone();
        let session_id = session.session_id.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match channel
                .request::<LogoutResponse>(WorkerRequestType::Logout, serde_json::json!({}), options)
                .await
            {
                Ok(_) => log_session_event(
                    "signing_session_lapsed",
                    &account_id,
                    serde_json::json!({ "session_id": session_id }),
                ),
                Err(e) => log_session_failure(
                    "worker_logout_failed",
                    &account_id,
                    e.kind().code(),
                    &e.to_string(),
                ),
            }
        });
        self.expiry_watch = Some(task.abort_handle());
    }

    fn activate(
        &mut self,
        account_id: &str,
        vrf_public_key: String,
        restored: bool,
    ) -> Result<VrfSession, OrchestratorError> {
        self.transition(LifecycleState::VrfActive)?;

        let mut session = VrfSession::new(account_id);
        session.activate(vrf_public_key, self.clock.now_ms());
        self.vrf_session = Some(session.clone());

        self.events.push(LifecycleEvent::VrfActivated {
            account_id: account_id.to_string(),
            restored,
        });
        info!(account_id = %account_id, restored, "VRF session active");
        Ok(session)
    }

    fn end_signing_session(&mut self, reason: SessionEndReason) {
        if let Some(watch) = self.expiry_watch.take() {
            watch.abort();
        }
        if let Some(session) = self.signing_session.take() {
            log_session_event(
                "signing_session_ended",
                &session.account_id,
                serde_json::json!({
                    "session_id": session.session_id,
                    "reason": reason,
                }),
            );
            self.events.push(LifecycleEvent::SigningSessionEnded {
                session_id: session.session_id,
                reason,
            });
        }
    }

    /// End a dead signing session and apply the exhaustion policy
    async fn finish_signing_session(
        &mut self,
        reason: SessionEndReason,
    ) -> Result<(), OrchestratorError> {
        self.end_signing_session(reason);
        match self.config.exhaustion_policy {
            ExhaustionPolicy::RetainVrf => self.transition(LifecycleState::VrfActive),
            ExhaustionPolicy::Logout => {
                if let Err(e) = self.logout().await {
                    warn!(error = %e, "worker logout after signing session end failed");
                }
                Ok(())
            }
        }
    }

    /// Deactivate everything after a failure past VRF activation
    async fn rollback(&mut self, account_id: &str, reason: &str) {
        self.end_signing_session(SessionEndReason::RolledBack);
        self.discard_worker_keypair(account_id).await;
        self.deactivate_vrf_session();
        self.reset_to_idle();

        self.events.push(LifecycleEvent::RolledBack {
            account_id: account_id.to_string(),
            reason: reason.to_string(),
        });
        log_session_event(
            "rolled_back",
            account_id,
            serde_json::json!({ "reason": reason }),
        );
    }

    async fn discard_worker_keypair(&self, account_id: &str) {
        let result = self
            .channel
            .request::<LogoutResponse>(
                WorkerRequestType::Logout,
                serde_json::json!({}),
                self.compensation_options(),
            )
            .await;
        if let Err(e) = result {
            log_session_failure("worker_logout_failed", account_id, e.kind().code(), &e.to_string());
        }
    }

    /// Forward requests carry the caller's abort signal
    fn send_options(&self) -> SendOptions {
        let options = SendOptions::default().with_timeout(self.config.channel_timeout);
        match &self.abort {
            Some(signal) => options.with_abort(signal.clone()),
            None => options,
        }
    }

    /// Compensating requests must still reach the worker after an abort
    fn compensation_options(&self) -> SendOptions {
        SendOptions::default().with_timeout(self.config.channel_timeout)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request_type: WorkerRequestType,
        payload: impl Serialize,
    ) -> Result<T, ChannelError> {
        self.channel
            .request(request_type, payload, self.send_options())
            .await
    }

    fn vrf_input(&self, account_id: &str, block: &BlockContext) -> VrfInputData {
        VrfInputData {
            user_id: account_id.to_string(),
            rp_id: self.config.rp_id.clone(),
            block_height: block.height,
            block_hash: b64u_encode(&block.hash),
            timestamp: Some(self.clock.now_ms()),
        }
    }
}

fn decode_vrf_output(challenge: &VrfChallenge) -> Result<Vec<u8>, ChannelError> {
    b64u_decode(&challenge.vrf_output).map_err(|e| ChannelError::InvalidResponse(e.to_string()))
}

fn is_escrow_failure(error: &ChannelError) -> bool {
    matches!(
        error.worker_code(),
        Some(error_codes::ESCROW_DISABLED | error_codes::ESCROW_TRANSPORT | error_codes::ESCROW_FAILED)
    )
}
