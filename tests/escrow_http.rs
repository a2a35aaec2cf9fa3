//! Integration tests for the relay over real HTTP
//!
//! Each test starts an in-process relay on an ephemeral port.

use num_bigint::BigUint;
use std::sync::Arc;
use tokio::net::TcpListener;
use vrf_authority::channel::{error_codes, SendOptions, WorkerRequestType};
use vrf_authority::clock::ManualClock;
use vrf_authority::escrow::{
    DoubleLocked, EscrowError, ServerKeyMaterial, Shamir3Pass, ShamirEscrowService,
};
use vrf_authority::threshold::{
    HttpThresholdAuthorizer, MemoryThresholdStore, ParticipantSet, ThresholdAuthEntry,
    ThresholdAuthRecord, ThresholdAuthorizer, ThresholdStoreError, UnauthorizedReason,
    AUTH_KEY_PREFIX,
};
use vrf_authority::types::ErrorResponse;
use vrf_authority::worker::{
    BootstrapResponse, EscrowClient, HttpEscrowClient, LogoutResponse, ShamirDecryptRequest,
    ShamirEncryptResponse, UnlockResponse,
};
use vrf_authority::{create_router, spawn_vrf_worker, AppState, WorkerChannel, WorkerConfig};

const NOW_MS: u64 = 1_700_000_000_000;

fn small_group() -> Shamir3Pass {
    // 2^127 - 1
    Shamir3Pass::new((BigUint::from(1u8) << 127) - BigUint::from(1u8)).unwrap()
}

struct Relay {
    url: String,
    threshold: Arc<MemoryThresholdStore>,
}

async fn start_relay(shamir: &Shamir3Pass, with_keys: bool, clock: &ManualClock) -> Relay {
    let current = with_keys.then(|| {
        ServerKeyMaterial::from_keypair(
            Some("relay-key-1".to_string()),
            shamir.generate_lock_keys().unwrap().into(),
        )
    });
    let escrow = Arc::new(ShamirEscrowService::new(
        shamir.clone(),
        current,
        Arc::new(clock.clone()),
    ));
    let threshold = Arc::new(MemoryThresholdStore::new(
        ParticipantSet::new(1, 2),
        Arc::new(clock.clone()),
    ));

    let app = create_router(Arc::new(AppState::new(escrow, threshold.clone())));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Relay {
        url: format!("http://{}", addr),
        threshold,
    }
}

fn worker_for(relay: &Relay, shamir: Shamir3Pass, clock: &ManualClock) -> WorkerChannel {
    let escrow = Arc::new(HttpEscrowClient::new(relay.url.clone()).unwrap());
    spawn_vrf_worker(
        WorkerConfig::default()
            .with_shamir(shamir)
            .with_escrow(escrow)
            .with_clock(Arc::new(clock.clone())),
    )
}

async fn call<T: serde::de::DeserializeOwned>(
    channel: &WorkerChannel,
    request_type: WorkerRequestType,
    payload: serde_json::Value,
) -> Result<T, vrf_authority::ChannelError> {
    channel
        .request(request_type, payload, SendOptions::default())
        .await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_escrow_roundtrip_through_relay() {
    let clock = ManualClock::new(NOW_MS);
    let shamir = small_group();
    let relay = start_relay(&shamir, true, &clock).await;
    let channel = worker_for(&relay, shamir, &clock);

    let boot: BootstrapResponse = call(
        &channel,
        WorkerRequestType::GenerateVrfKeypairBootstrap,
        serde_json::json!({"accountId": "alice.near"}),
    )
    .await
    .unwrap();

    let escrowed: ShamirEncryptResponse = call(
        &channel,
        WorkerRequestType::Shamir3passClientEncryptCurrentVrfKeypair,
        serde_json::json!({}),
    )
    .await
    .unwrap();
    assert_eq!(
        escrowed.server_encrypted_vrf_keypair.server_key_id.as_deref(),
        Some("relay-key-1")
    );

    let _: LogoutResponse = call(&channel, WorkerRequestType::Logout, serde_json::json!({}))
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

#[tokio::test(flavor = "multi_thread")]
async fn test_unconfigured_relay_fails_closed() {
    let clock = ManualClock::new(NOW_MS);
    let shamir = small_group();
    let relay = start_relay(&shamir, false, &clock).await;
    let channel = worker_for(&relay, shamir, &clock);

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

#[tokio::test(flavor = "multi_thread")]
async fn test_unconfigured_relay_unlock_with_key_id_returns_503() {
    let clock = ManualClock::new(NOW_MS);
    let relay = start_relay(&small_group(), false, &clock).await;

    let response = reqwest::Client::new()
        .post(format!("{}/vrf/remove-server-lock", relay.url))
        .json(&serde_json::json!({"kek_cs_b64u": "Aw", "keyId": "abc123"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "SHAMIR_DISABLED");

    // A stored record always names its key; the worker still sees a disabled relay
    let escrow = HttpEscrowClient::new(relay.url.clone()).unwrap();
    let kek_cs = DoubleLocked::from_b64u("Aw").unwrap();
    let err = escrow
        .remove_server_lock(&kek_cs, Some("abc123"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EscrowError::Rejected { ref code, .. } if code == "SHAMIR_DISABLED"
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_threshold_authorizer_over_http() {
    let clock = ManualClock::new(NOW_MS);
    let relay = start_relay(&small_group(), false, &clock).await;

    let key = format!("{}session-1", AUTH_KEY_PREFIX);
    let expires_at_ms = NOW_MS + 60_000;
    let entry = ThresholdAuthEntry::new(
        ThresholdAuthRecord {
            user_id: "alice.near".to_string(),
            rp_id: "wallet.example".to_string(),
            relayer_key_id: "relayer-key-1".to_string(),
            participant_ids: vec![2, 1],
            expires_at_ms,
        },
        2,
    );
    vrf_authority::threshold::ThresholdStore::put_auth_entry(relay.threshold.as_ref(), &key, &entry)
        .await
        .unwrap();

    let authorizer = HttpThresholdAuthorizer::new(relay.url.clone()).unwrap();
    assert_eq!(authorizer.consume_use(&key).await.unwrap(), 1);
    assert_eq!(authorizer.consume_use(&key).await.unwrap(), 0);

    let err = authorizer.consume_use(&key).await.unwrap_err();
    assert!(matches!(
        err,
        ThresholdStoreError::Unauthorized(UnauthorizedReason::Exhausted)
    ));
}
