//! Threshold Authorization Store
//!
//! Consume-once authorization records for two-party threshold signing.
//! Each signing window gets one [`ThresholdAuthEntry`]; every signing attempt
//! atomically decrements `remainingUses`.
//!
//! Implementations:
//! - [`MemoryThresholdStore`] - one mutex serializes every operation
//! - [`SqliteThresholdStore`] - `BEGIN IMMEDIATE` transactions over an r2d2 pool

pub mod client;
pub mod memory;
pub mod ops;
pub mod sqlite;
pub mod traits;

pub use client::HttpThresholdAuthorizer;
pub use memory::MemoryThresholdStore;
pub use ops::{execute, StoreOp, StoreRequest, StoreResponse, AUTH_KEY_PREFIX};
pub use sqlite::SqliteThresholdStore;
pub use traits::{ThresholdAuthorizer, ThresholdResult, ThresholdStore};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Why a consume was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnauthorizedReason {
    NotFound,
    Expired,
    Exhausted,
    ParticipantMismatch,
}

impl std::fmt::Display for UnauthorizedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnauthorizedReason::NotFound => "authorization not found",
            UnauthorizedReason::Expired => "authorization expired",
            UnauthorizedReason::Exhausted => "authorization exhausted",
            UnauthorizedReason::ParticipantMismatch => "participant set mismatch",
        };
        f.write_str(s)
    }
}

/// Threshold store errors
#[derive(Debug, Error)]
pub enum ThresholdStoreError {
    #[error("unauthorized: {0}")]
    Unauthorized(UnauthorizedReason),

    #[error("participant ids {actual:?} do not match configured set {expected:?}")]
    ParticipantMismatch { expected: Vec<u16>, actual: Vec<u16> },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("relay request failed: {0}")]
    Transport(String),
}

impl ThresholdStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ThresholdStoreError::Unauthorized(_) => ErrorKind::AuthorizationExhausted,
            ThresholdStoreError::ParticipantMismatch { .. } | ThresholdStoreError::InvalidData(_) => {
                ErrorKind::MalformedInput
            }
            ThresholdStoreError::Database(_) => ErrorKind::Internal,
            ThresholdStoreError::Connection(_) | ThresholdStoreError::Transport(_) => {
                ErrorKind::Transport
            }
        }
    }

    /// Code used in `{ok:false, code}` responses
    pub fn code(&self) -> &'static str {
        match self {
            ThresholdStoreError::Unauthorized(_) => "UNAUTHORIZED",
            ThresholdStoreError::ParticipantMismatch { .. } => "PARTICIPANT_MISMATCH",
            ThresholdStoreError::InvalidData(_) => "INVALID_DATA",
            ThresholdStoreError::Database(_) => "DATABASE_ERROR",
            ThresholdStoreError::Connection(_) => "CONNECTION_ERROR",
            ThresholdStoreError::Transport(_) => "TRANSPORT_ERROR",
        }
    }
}

/// The configured two-party signer set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantSet {
    pub client: u16,
    pub relayer: u16,
}

impl ParticipantSet {
    pub fn new(client: u16, relayer: u16) -> Self {
        Self { client, relayer }
    }

    pub fn ids(&self) -> Vec<u16> {
        let mut ids = vec![self.client, self.relayer];
        ids.sort_unstable();
        ids
    }

    /// Order-insensitive equality; duplicates never match
    pub fn matches(&self, participant_ids: &[u16]) -> bool {
        let mut ids = participant_ids.to_vec();
        ids.sort_unstable();
        ids == self.ids()
    }

    pub fn check(&self, participant_ids: &[u16]) -> Result<(), ThresholdStoreError> {
        if self.matches(participant_ids) {
            Ok(())
        } else {
            Err(ThresholdStoreError::ParticipantMismatch {
                expected: self.ids(),
                actual: participant_ids.to_vec(),
            })
        }
    }
}

/// Authorization scope bound to one threshold signing window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdAuthRecord {
    pub user_id: String,
    pub rp_id: String,
    pub relayer_key_id: String,
    pub participant_ids: Vec<u16>,
    pub expires_at_ms: u64,
}

/// Stored authorization with its remaining budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdAuthEntry {
    pub record: ThresholdAuthRecord,
    pub remaining_uses: u32,
    pub expires_at_ms: u64,
}

impl ThresholdAuthEntry {
    pub fn new(record: ThresholdAuthRecord, remaining_uses: u32) -> Self {
        let expires_at_ms = record.expires_at_ms;
        Self {
            record,
            remaining_uses,
            expires_at_ms,
        }
    }

    /// Earliest of the entry and record deadlines
    pub fn effective_expiry_ms(&self) -> u64 {
        self.expires_at_ms.min(self.record.expires_at_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.effective_expiry_ms()
    }
}

/// Result of a successful consume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeOutcome {
    pub record: ThresholdAuthRecord,
    pub remaining_uses: u32,
}

/// What a store must do with the entry it just read
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConsumeDecision {
    Reject {
        reason: UnauthorizedReason,
        delete: bool,
    },
    Update(ThresholdAuthEntry),
}

/// Shared consume rule; stores apply the decision inside their critical section
pub(crate) fn decide_consume(
    entry: &ThresholdAuthEntry,
    now_ms: u64,
    participants: &ParticipantSet,
) -> ConsumeDecision {
    if !participants.matches(&entry.record.participant_ids) {
        return ConsumeDecision::Reject {
            reason: UnauthorizedReason::ParticipantMismatch,
            delete: false,
        };
    }
    if entry.is_expired(now_ms) {
        return ConsumeDecision::Reject {
            reason: UnauthorizedReason::Expired,
            delete: true,
        };
    }
    if entry.remaining_uses == 0 {
        return ConsumeDecision::Reject {
            reason: UnauthorizedReason::Exhausted,
            delete: false,
        };
    }
    let mut updated = entry.clone();
    updated.remaining_uses -= 1;
    ConsumeDecision::Update(updated)
}

/// Validation applied before any auth entry is written
pub(crate) fn validate_new_entry(
    entry: &ThresholdAuthEntry,
    now_ms: u64,
    participants: &ParticipantSet,
) -> Result<(), ThresholdStoreError> {
    participants.check(&entry.record.participant_ids)?;
    if entry.record.user_id.trim().is_empty() || entry.record.relayer_key_id.trim().is_empty() {
        return Err(ThresholdStoreError::InvalidData(
            "userId and relayerKeyId are required".to_string(),
        ));
    }
    if entry.is_expired(now_ms) {
        return Err(ThresholdStoreError::InvalidData(
            "authorization already expired".to_string(),
        ));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_participant_set_matching() {
        let set = ParticipantSet::new(1, 2);
        assert!(set.matches(&[1, 2]));
        assert!(set.matches(&[2, 1]));
        assert!(!set.matches(&[1, 1]));
        assert!(!set.matches(&[1, 2, 3]));
        assert!(!set.matches(&[1]));
        assert!(matches!(
            set.check(&[1, 3]),
            Err(ThresholdStoreError::ParticipantMismatch { .. })
        ));
    }

    #[test]
    fn test_decide_consume() {
        let set = ParticipantSet::new(1, 2);

        match decide_consume(&entry(2, 1_000), 500, &set) {
            ConsumeDecision::Update(updated) => assert_eq!(updated.remaining_uses, 1),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            decide_consume(&entry(2, 1_000), 1_001, &set),
            ConsumeDecision::Reject {
                reason: UnauthorizedReason::Expired,
                delete: true
            }
        );
        assert_eq!(
            decide_consume(&entry(0, 1_000), 500, &set),
            ConsumeDecision::Reject {
                reason: UnauthorizedReason::Exhausted,
                delete: false
            }
        );
        // Deadline itself is still valid.
        assert!(matches!(
            decide_consume(&entry(1, 1_000), 1_000, &set),
            ConsumeDecision::Update(_)
        ));
    }

    #[test]
    fn test_entry_wire_format() {
        let json = serde_json::to_value(entry(3, 42)).unwrap();
        assert_eq!(json["remainingUses"], 3);
        assert_eq!(json["record"]["participantIds"], serde_json::json!([1, 2]));
        assert_eq!(json["record"]["relayerKeyId"], "relayer-key-1");
    }
}
