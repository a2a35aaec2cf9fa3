//! In-Memory Threshold Store
//!
//! Every operation takes the same mutex, so each request runs to completion
//! before the next one starts. Data is lost when the process restarts.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::traits::{ThresholdResult, ThresholdStore};
use super::{
    decide_consume, validate_new_entry, ConsumeDecision, ConsumeOutcome, ParticipantSet,
    ThresholdAuthEntry, ThresholdStoreError, UnauthorizedReason,
};
use crate::clock::Clock;
use crate::logging::log_threshold_event;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |deadline| now_ms <= deadline)
    }
}

/// In-memory threshold store
pub struct MemoryThresholdStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    participants: ParticipantSet,
    clock: Arc<dyn Clock>,
}

impl MemoryThresholdStore {
    pub fn new(participants: ParticipantSet, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            participants,
            clock,
        }
    }

    /// Number of stored keys, expired or not
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ThresholdStore for MemoryThresholdStore {
    async fn get(&self, key: &str) -> ThresholdResult<Option<Value>> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(stored) if stored.is_live(now) => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) -> ThresholdResult<()> {
        let now = self.clock.now_ms();
        let stored = StoredValue {
            value,
            expires_at_ms: ttl_ms.map(|ttl| now + ttl),
        };
        self.entries.lock().await.insert(key.to_string(), stored);
        Ok(())
    }

    async fn del(&self, key: &str) -> ThresholdResult<bool> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn getdel(&self, key: &str) -> ThresholdResult<Option<Value>> {
        let now = self.clock.now_ms();
        let removed = self.entries.lock().await.remove(key);
        Ok(removed.filter(|s| s.is_live(now)).map(|s| s.value))
    }

    async fn put_auth_entry(&self, key: &str, entry: &ThresholdAuthEntry) -> ThresholdResult<()> {
        let now = self.clock.now_ms();
        validate_new_entry(entry, now, &self.participants)?;
        let value =
            serde_json::to_value(entry).map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))?;

        self.entries.lock().await.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at_ms: Some(entry.effective_expiry_ms()),
            },
        );
        log_threshold_event(
            "auth_entry_stored",
            key,
            true,
            serde_json::json!({"remainingUses": entry.remaining_uses}),
        );
        Ok(())
    }

    async fn consume_use(&self, key: &str) -> ThresholdResult<ConsumeOutcome> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;

        let entry: ThresholdAuthEntry = match entries.get(key) {
            Some(stored) => serde_json::from_value(stored.value.clone())
                .map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))?,
            None => {
                log_threshold_event("consume_rejected", key, false, serde_json::json!({"reason": "not_found"}));
                return Err(ThresholdStoreError::Unauthorized(UnauthorizedReason::NotFound));
            }
        };

        match decide_consume(&entry, now, &self.participants) {
            ConsumeDecision::Reject { reason, delete } => {
                if delete {
                    entries.remove(key);
                }
                log_threshold_event(
                    "consume_rejected",
                    key,
                    false,
                    serde_json::json!({"reason": reason, "deleted": delete}),
                );
                Err(ThresholdStoreError::Unauthorized(reason))
            }
            ConsumeDecision::Update(updated) => {
                let value = serde_json::to_value(&updated)
                    .map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))?;
                entries.insert(
                    key.to_string(),
                    StoredValue {
                        value,
                        expires_at_ms: Some(updated.effective_expiry_ms()),
                    },
                );
                log_threshold_event(
                    "consume_accepted",
                    key,
                    true,
                    serde_json::json!({"remainingUses": updated.remaining_uses}),
                );
                Ok(ConsumeOutcome {
                    record: updated.record,
                    remaining_uses: updated.remaining_uses,
                })
            }
        }
    }

    async fn purge_expired(&self) -> ThresholdResult<usize> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, stored| stored.is_live(now));
        Ok(before - entries.len())
    }
}
