//! Threshold store interfaces.

use async_trait::async_trait;
use serde_json::Value;

use super::{ConsumeOutcome, ThresholdAuthEntry, ThresholdStoreError};

/// Result type for threshold store operations
pub type ThresholdResult<T> = Result<T, ThresholdStoreError>;

/// Key-value store with atomic consume-once counters
///
/// Implementations:
/// - `SqliteThresholdStore` - durable storage with SQLite
/// - `MemoryThresholdStore` - in-memory storage for tests and single nodes
#[async_trait]
pub trait ThresholdStore: Send + Sync {
    /// Read a value; expired values read as absent
    async fn get(&self, key: &str) -> ThresholdResult<Option<Value>>;

    /// Write a value with an optional TTL
    async fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) -> ThresholdResult<()>;

    /// Delete a value; returns whether it existed
    async fn del(&self, key: &str) -> ThresholdResult<bool>;

    /// Read and delete in one step
    async fn getdel(&self, key: &str) -> ThresholdResult<Option<Value>>;

    /// Validate participants and expiry, then write with TTL at the entry deadline
    async fn put_auth_entry(&self, key: &str, entry: &ThresholdAuthEntry) -> ThresholdResult<()>;

    /// Atomically spend one use of the entry under `key`
    async fn consume_use(&self, key: &str) -> ThresholdResult<ConsumeOutcome>;

    /// Same as `consume_use`, returning only the updated count
    async fn consume_use_count(&self, key: &str) -> ThresholdResult<u32> {
        self.consume_use(key).await.map(|outcome| outcome.remaining_uses)
    }

    /// Remove every value whose TTL has passed
    async fn purge_expired(&self) -> ThresholdResult<usize>;
}

/// What the lifecycle orchestrator needs for threshold accounts
#[async_trait]
pub trait ThresholdAuthorizer: Send + Sync {
    /// Spend one authorization; returns the remaining count
    async fn consume_use(&self, session_key: &str) -> ThresholdResult<u32>;
}

#[async_trait]
impl<T> ThresholdAuthorizer for T
where
    T: ThresholdStore + ?Sized,
{
    async fn consume_use(&self, session_key: &str) -> ThresholdResult<u32> {
        ThresholdStore::consume_use_count(self, session_key).await
    }
}
