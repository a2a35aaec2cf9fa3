//! SQLite Persistent Threshold Store
//!
//! Survives relay restarts. `consume_use` runs inside a `BEGIN IMMEDIATE`
//! transaction, which takes the database write lock before the read, so two
//! connections can never both observe the last remaining use.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use super::traits::{ThresholdResult, ThresholdStore};
use super::{
    decide_consume, validate_new_entry, ConsumeDecision, ConsumeOutcome, ParticipantSet,
    ThresholdAuthEntry, ThresholdStoreError, UnauthorizedReason,
};
use crate::clock::Clock;
use crate::logging::log_threshold_event;

fn db_error(e: impl std::fmt::Display) -> ThresholdStoreError {
    ThresholdStoreError::Database(e.to_string())
}

/// SQLite-backed threshold store with connection pooling
pub struct SqliteThresholdStore {
    pool: Pool<SqliteConnectionManager>,
    participants: ParticipantSet,
    clock: Arc<dyn Clock>,
}

impl SqliteThresholdStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        participants: ParticipantSet,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ThresholdStoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| ThresholdStoreError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            participants,
            clock,
        };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory(
        participants: ParticipantSet,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ThresholdStoreError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| ThresholdStoreError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            participants,
            clock,
        };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, ThresholdStoreError> {
        self.pool
            .get()
            .map_err(|e| ThresholdStoreError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), ThresholdStoreError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS threshold_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_threshold_kv_expires ON threshold_kv(expires_at_ms);
            "#,
        )
        .map_err(db_error)?;

        Ok(())
    }

    fn is_live(expires_at_ms: Option<i64>, now_ms: u64) -> bool {
        expires_at_ms.map_or(true, |deadline| now_ms as i64 <= deadline)
    }

    fn parse_value(raw: &str) -> Result<Value, ThresholdStoreError> {
        serde_json::from_str(raw).map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))
    }

    // Synchronous helper methods for the trait implementations

    fn get_sync(&self, key: &str, delete: bool) -> ThresholdResult<Option<Value>> {
        let now = self.clock.now_ms();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;

        let row: Option<(String, Option<i64>)> = tx
            .query_row(
                "SELECT value, expires_at_ms FROM threshold_kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_error)?;

        let result = match row {
            Some((raw, expires_at_ms)) => {
                let live = Self::is_live(expires_at_ms, now);
                if delete || !live {
                    tx.execute("DELETE FROM threshold_kv WHERE key = ?1", params![key])
                        .map_err(db_error)?;
                }
                if live {
                    Some(Self::parse_value(&raw)?)
                } else {
                    None
                }
            }
            None => None,
        };

        tx.commit().map_err(db_error)?;
        Ok(result)
    }

    fn set_sync(&self, key: &str, value: &Value, expires_at_ms: Option<u64>) -> ThresholdResult<()> {
        let conn = self.conn()?;
        let raw = serde_json::to_string(value)
            .map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))?;
        conn.execute(
            r#"
            INSERT INTO threshold_kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms
            "#,
            params![key, raw, expires_at_ms.map(|v| v as i64)],
        )
        .map_err(db_error)?;
        Ok(())
    }

    fn del_sync(&self, key: &str) -> ThresholdResult<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute("DELETE FROM threshold_kv WHERE key = ?1", params![key])
            .map_err(db_error)?;
        Ok(rows > 0)
    }

    fn consume_sync(&self, key: &str) -> ThresholdResult<ConsumeOutcome> {
        let now = self.clock.now_ms();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;

        let raw: Option<String> = tx
            .query_row(
                "SELECT value FROM threshold_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error)?;

        let entry: ThresholdAuthEntry = match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))?,
            None => {
                log_threshold_event("consume_rejected", key, false, serde_json::json!({"reason": "not_found"}));
                return Err(ThresholdStoreError::Unauthorized(UnauthorizedReason::NotFound));
            }
        };

        match decide_consume(&entry, now, &self.participants) {
            ConsumeDecision::Reject { reason, delete } => {
                if delete {
                    tx.execute("DELETE FROM threshold_kv WHERE key = ?1", params![key])
                        .map_err(db_error)?;
                    tx.commit().map_err(db_error)?;
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
                let raw = serde_json::to_string(&updated)
                    .map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))?;
                tx.execute(
                    "UPDATE threshold_kv SET value = ?2, expires_at_ms = ?3 WHERE key = ?1",
                    params![key, raw, updated.effective_expiry_ms() as i64],
                )
                .map_err(db_error)?;
                tx.commit().map_err(db_error)?;

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

    fn purge_sync(&self) -> ThresholdResult<usize> {
        let now = self.clock.now_ms() as i64;
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM threshold_kv WHERE expires_at_ms IS NOT NULL AND expires_at_ms < ?1",
            params![now],
        )
        .map_err(db_error)
    }
}

#[async_trait]
impl ThresholdStore for SqliteThresholdStore {
    async fn get(&self, key: &str) -> ThresholdResult<Option<Value>> {
        self.get_sync(key, false)
    }

    async fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) -> ThresholdResult<()> {
        let expires_at_ms = ttl_ms.map(|ttl| self.clock.now_ms() + ttl);
        self.set_sync(key, &value, expires_at_ms)
    }

    async fn del(&self, key: &str) -> ThresholdResult<bool> {
        self.del_sync(key)
    }

    async fn getdel(&self, key: &str) -> ThresholdResult<Option<Value>> {
        self.get_sync(key, true)
    }

    async fn put_auth_entry(&self, key: &str, entry: &ThresholdAuthEntry) -> ThresholdResult<()> {
        validate_new_entry(entry, self.clock.now_ms(), &self.participants)?;
        let value =
            serde_json::to_value(entry).map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))?;
        self.set_sync(key, &value, Some(entry.effective_expiry_ms()))?;
        log_threshold_event(
            "auth_entry_stored",
            key,
            true,
            serde_json::json!({"remainingUses": entry.remaining_uses}),
        );
        Ok(())
    }

    async fn consume_use(&self, key: &str) -> ThresholdResult<ConsumeOutcome> {
        self.consume_sync(key)
    }

    async fn purge_expired(&self) -> ThresholdResult<usize> {
        self.purge_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::threshold::test_support::{entry, record};
    use tempfile::tempdir;

    fn in_memory(clock: &ManualClock) -> SqliteThresholdStore {
        SqliteThresholdStore::in_memory(ParticipantSet::new(1, 2), Arc::new(clock.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_kv_ops() {
        let clock = ManualClock::new(0);
        let store = in_memory(&clock);

        store.set("k", serde_json::json!({"a": 1}), Some(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(serde_json::json!({"a": 1})));
        store.set("k", serde_json::json!({"a": 2}), None).await.unwrap();
        clock.advance(100);
        assert_eq!(store.getdel("k").await.unwrap(), Some(serde_json::json!({"a": 2})));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_consume_flow() {
        let clock = ManualClock::new(0);
        let store = in_memory(&clock);
        store.put_auth_entry("auth:1", &entry(2, 5_000)).await.unwrap();

        let outcome = store.consume_use("auth:1").await.unwrap();
        assert_eq!(outcome.remaining_uses, 1);
        assert_eq!(outcome.record.user_id, "alice.near");
        assert_eq!(store.consume_use_count("auth:1").await.unwrap(), 0);
        assert!(matches!(
            store.consume_use("auth:1").await,
            Err(ThresholdStoreError::Unauthorized(UnauthorizedReason::Exhausted))
        ));
    }

    #[tokio::test]
    async fn test_expired_deleted() {
        let clock = ManualClock::new(0);
        let store = in_memory(&clock);
        store.put_auth_entry("auth:1", &entry(3, 1_000)).await.unwrap();

        clock.set(2_000);
        assert!(matches!(
            store.consume_use("auth:1").await,
            Err(ThresholdStoreError::Unauthorized(UnauthorizedReason::Expired))
        ));
        assert!(!store.del("auth:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatched_participants_not_written() {
        let clock = ManualClock::new(0);
        let store = in_memory(&clock);
        let bad = ThresholdAuthEntry::new(record(vec![7, 8], 5_000), 1);

        assert!(matches!(
            store.put_auth_entry("auth:bad", &bad).await,
            Err(ThresholdStoreError::ParticipantMismatch { .. })
        ));
        assert!(store.get("auth:bad").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consume_file_backed() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(0);
        let store = Arc::new(
            SqliteThresholdStore::new(
                dir.path().join("threshold.db"),
                ParticipantSet::new(1, 2),
                Arc::new(clock.clone()),
            )
            .unwrap(),
        );
        store.put_auth_entry("auth:1", &entry(1, 10_000)).await.unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.consume_use("auth:1").await })
            })
            .collect();

        let mut successes = 0;
        let mut rejections = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    assert_eq!(outcome.remaining_uses, 0);
                    successes += 1;
                }
                Err(ThresholdStoreError::Unauthorized(UnauthorizedReason::Exhausted)) => {
                    rejections += 1
                }
                Err(other) => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!((successes, rejections), (1, 1));
    }

    #[tokio::test]
    async fn test_purge() {
        let clock = ManualClock::new(0);
        let store = in_memory(&clock);
        store.set("a", serde_json::json!(1), Some(10)).await.unwrap();
        store.set("b", serde_json::json!(1), None).await.unwrap();
        clock.set(100);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }
}
