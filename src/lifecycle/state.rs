//! Lifecycle states, sessions, and audit events.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Authenticating,
    VrfUnlocking,
    VrfActive,
    MintingSigningSession,
    SigningSessionActive,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Authenticating => "authenticating",
            LifecycleState::VrfUnlocking => "vrf_unlocking",
            LifecycleState::VrfActive => "vrf_active",
            LifecycleState::MintingSigningSession => "minting_signing_session",
            LifecycleState::SigningSessionActive => "signing_session_active",
        }
    }

    /// Allowed edges; every state may fall back to `Idle`
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if next == Idle {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Authenticating)
                | (Idle, VrfActive)
                | (Authenticating, VrfUnlocking)
                | (VrfUnlocking, VrfActive)
                | (VrfActive, MintingSigningSession)
                | (SigningSessionActive, MintingSigningSession)
                | (MintingSigningSession, SigningSessionActive)
                | (SigningSessionActive, VrfActive)
        )
    }

    /// States in which a VRF keypair is unlocked in the worker
    pub fn has_active_vrf(&self) -> bool {
        matches!(
            self,
            LifecycleState::VrfActive
                | LifecycleState::MintingSigningSession
                | LifecycleState::SigningSessionActive
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrfSession {
    pub account_id: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_public_key: Option<String>,
    pub activated_at_ms: u64,
}

impl VrfSession {
    /// Created inactive
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            active: false,
            vrf_public_key: None,
            activated_at_ms: 0,
        }
    }

    pub fn activate(&mut self, vrf_public_key: String, now_ms: u64) {
        self.active = true;
        self.vrf_public_key = Some(vrf_public_key);
        self.activated_at_ms = now_ms;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Warm signing grant; dead once exhausted or past `expires_at_ms`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningSession {
    pub session_id: String,
    pub account_id: String,
    pub remaining_uses: u32,
    pub expires_at_ms: u64,
    /// Threshold store key for accounts that sign with a relayer share
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_key: Option<String>,
}

impl SigningSession {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_uses == 0
    }

    pub fn is_live(&self, now_ms: u64) -> bool {
        !self.is_exhausted() && !self.is_expired(now_ms)
    }
}

/// What happens to the VRF session when a signing session dies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Stay unlocked; a new signing session can be minted
    #[default]
    RetainVrf,
    /// Lock the VRF keypair too
    Logout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    Exhausted,
    Expired,
    Cleared,
    Replaced,
    RolledBack,
    LoggedOut,
}

/// Audit trail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    Registered {
        account_id: String,
        server_assisted: bool,
    },
    VrfActivated {
        account_id: String,
        restored: bool,
    },
    SigningSessionMinted {
        session_id: String,
        remaining_uses: u32,
        expires_at_ms: u64,
    },
    SigningAuthorized {
        session_id: String,
        remaining_uses: u32,
    },
    SigningSessionEnded {
        session_id: String,
        reason: SessionEndReason,
    },
    RolledBack {
        account_id: String,
        reason: String,
    },
    LoggedOut {
        account_id: Option<String>,
    },
}

/// Point-in-time view for callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    pub account_id: Option<String>,
    pub vrf_active: bool,
    pub signing_session: Option<SigningSession>,
}
