//! Concurrent consume-once behavior of both threshold stores

use std::sync::Arc;
use tempfile::tempdir;
use vrf_authority::clock::ManualClock;
use vrf_authority::threshold::{
    MemoryThresholdStore, ParticipantSet, SqliteThresholdStore, ThresholdAuthEntry,
    ThresholdAuthRecord, ThresholdStore, ThresholdStoreError, UnauthorizedReason,
};

const NOW_MS: u64 = 1_700_000_000_000;
const KEY: &str = "threshold-auth:race";

fn entry(remaining_uses: u32) -> ThresholdAuthEntry {
    ThresholdAuthEntry::new(
        ThresholdAuthRecord {
            user_id: "alice.near".to_string(),
            rp_id: "wallet.example".to_string(),
            relayer_key_id: "relayer-key-1".to_string(),
            participant_ids: vec![1, 2],
            expires_at_ms: NOW_MS + 60_000,
        },
        remaining_uses,
    )
}

/// Race `callers` consumers against one entry; returns (successes, unauthorized)
async fn race(store: Arc<dyn ThresholdStore>, callers: usize) -> (usize, usize) {
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.consume_use(KEY).await })
        })
        .collect();

    let mut successes = 0;
    let mut unauthorized = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(ThresholdStoreError::Unauthorized(UnauthorizedReason::Exhausted)) => {
                unauthorized += 1
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    (successes, unauthorized)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_store_single_use_race() {
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let store = Arc::new(MemoryThresholdStore::new(ParticipantSet::new(1, 2), clock));
    store.put_auth_entry(KEY, &entry(1)).await.unwrap();

    assert_eq!(race(store, 8).await, (1, 7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_store_single_use_race() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let store = Arc::new(
        SqliteThresholdStore::new(dir.path().join("threshold.db"), ParticipantSet::new(1, 2), clock)
            .unwrap(),
    );
    store.put_auth_entry(KEY, &entry(1)).await.unwrap();

    assert_eq!(race(store, 8).await, (1, 7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_store_budget_is_exact() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let store = Arc::new(
        SqliteThresholdStore::new(dir.path().join("threshold.db"), ParticipantSet::new(1, 2), clock)
            .unwrap(),
    );
    store.put_auth_entry(KEY, &entry(3)).await.unwrap();

    assert_eq!(race(store.clone(), 10).await, (3, 7));
    let remaining: ThresholdAuthEntry =
        serde_json::from_value(store.get(KEY).await.unwrap().unwrap()).unwrap();
    assert_eq!(remaining.remaining_uses, 0);
}
