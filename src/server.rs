//! Axum HTTP server for the VRF relay
//!
//! Exposes the Shamir escrow lock endpoints and the threshold store.

use crate::escrow::{ClientLocked, DoubleLocked, EscrowError, KeyInfo, ShamirEscrowService};
use crate::logging::log_security_event;
use crate::threshold::{self, StoreRequest, StoreResponse, ThresholdStore};
use crate::types::{
    ApplyServerLockRequest, ApplyServerLockResponse, ErrorResponse, HealthResponse,
    RemoveServerLockRequest, RemoveServerLockResponse,
};
use axum::http::{header, HeaderValue, Method};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
pub struct AppState {
    pub escrow: Arc<ShamirEscrowService>,
    pub threshold: Arc<dyn ThresholdStore>,
    /// Origins allowed by CORS
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(escrow: Arc<ShamirEscrowService>, threshold: Arc<dyn ThresholdStore>) -> Self {
        Self {
            escrow,
            threshold,
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}

/// Create the router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(
            state
                .allowed_origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        )
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        // Health & info
        .route("/health", get(health_handler))
        .route("/shamir/key-info", get(key_info_handler))
        // Escrow
        .route("/vrf/apply-server-lock", post(apply_server_lock_handler))
        .route("/vrf/remove-server-lock", post(remove_server_lock_handler))
        // Threshold store
        .route("/threshold/store", post(threshold_store_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let info = state.escrow.key_info().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        shamir_apply_enabled: info.apply_lock_enabled,
        shamir_remove_enabled: info.remove_lock_enabled,
        key_id: info.current_key_id,
    })
}

async fn key_info_handler(State(state): State<Arc<AppState>>) -> Json<KeyInfo> {
    Json(state.escrow.key_info().await)
}

/// Second pass: lock a client-locked KEK with `e_s`
async fn apply_server_lock_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ApplyServerLockRequest>,
) -> Result<Json<ApplyServerLockResponse>, ApiError> {
    let kek_c = ClientLocked::from_b64u(&request.kek_c_b64u).map_err(escrow_error)?;
    let (kek_cs, key_id) = state
        .escrow
        .apply_server_lock(&kek_c)
        .await
        .map_err(escrow_error)?;

    Ok(Json(ApplyServerLockResponse {
        kek_cs_b64u: kek_cs.to_b64u(),
        key_id,
    }))
}

/// Unlock pass: strip the server lock with the matching `d_s`
async fn remove_server_lock_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RemoveServerLockRequest>,
) -> Result<Json<RemoveServerLockResponse>, ApiError> {
    let kek_cs = DoubleLocked::from_b64u(&request.kek_cs_b64u).map_err(escrow_error)?;
    let kek_c = state
        .escrow
        .remove_server_lock(&kek_cs, request.key_id.as_deref())
        .await
        .map_err(escrow_error)?;

    Ok(Json(RemoveServerLockResponse {
        kek_c_b64u: kek_c.to_b64u(),
    }))
}

/// Store operations always answer 200; failures travel in-band as `{ok:false}`
async fn threshold_store_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StoreRequest>,
) -> Json<StoreResponse> {
    Json(threshold::execute(state.threshold.as_ref(), request).await)
}

fn escrow_error(e: EscrowError) -> ApiError {
    let (status, code) = match &e {
        EscrowError::Disabled(_) => (StatusCode::SERVICE_UNAVAILABLE, "SHAMIR_DISABLED"),
        EscrowError::InvalidEncoding(_) | EscrowError::InvalidValue(_) => {
            (StatusCode::BAD_REQUEST, "INVALID_INPUT")
        }
        EscrowError::UnknownKeyId(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_KEY_ID"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "escrow request failed");
    } else {
        log_security_event(
            "escrow_request_rejected",
            false,
            serde_json::json!({ "code": code, "reason": e.to_string() }),
            None,
        );
    }

    (status, Json(ErrorResponse::new(code, e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::escrow::{ServerKeyMaterial, Shamir3Pass};
    use crate::threshold::{MemoryThresholdStore, ParticipantSet};
    use axum::body::Body;
    use axum::http::Request;
    use num_bigint::BigUint;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn small_group() -> Shamir3Pass {
        Shamir3Pass::new((BigUint::from(1u8) << 127) - BigUint::from(1u8)).unwrap()
    }

    fn app(shamir: &Shamir3Pass, enabled: bool) -> Router {
        let clock = ManualClock::new(1_000);
        let current = enabled.then(|| {
            ServerKeyMaterial::from_keypair(
                Some("key-1".to_string()),
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
            Arc::new(clock),
        ));
        create_router(Arc::new(AppState::new(escrow, threshold)))
    }

    async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_lock_roundtrip_over_http() {
        let shamir = small_group();
        let app = app(&shamir, true);

        let client = shamir.generate_lock_keys().unwrap();
        let kek = shamir.random_kek();
        let kek_c = shamir.lock_kek(&kek, &client);

        let (status, applied) = post(
            &app,
            "/vrf/apply-server-lock",
            json!({ "kek_c_b64u": kek_c.to_b64u() }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(applied["keyId"], "key-1");

        let (status, removed) = post(
            &app,
            "/vrf/remove-server-lock",
            json!({ "kek_cs_b64u": applied["kek_cs_b64u"], "keyId": "key-1" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(removed["kek_c_b64u"], kek_c.to_b64u());
    }

    #[tokio::test]
    async fn test_disabled_escrow_returns_503() {
        let shamir = small_group();
        let app = app(&shamir, false);

        let (status, body) = post(&app, "/vrf/apply-server-lock", json!({ "kek_c_b64u": "Aw" })).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "SHAMIR_DISABLED");

        let (status, health) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["shamir_apply_enabled"], false);
    }

    #[tokio::test]
    async fn test_invalid_lock_value_rejected() {
        let shamir = small_group();
        let app = app(&shamir, true);

        let (status, body) = post(&app, "/vrf/apply-server-lock", json!({ "kek_c_b64u": "!!" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_INPUT");

        let (status, body) = post(
            &app,
            "/vrf/remove-server-lock",
            json!({ "kek_cs_b64u": "Aw", "keyId": "retired" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "UNKNOWN_KEY_ID");
    }

    #[tokio::test]
    async fn test_key_info() {
        let shamir = small_group();
        let app = app(&shamir, true);

        let (status, info) = get_json(&app, "/shamir/key-info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["currentKeyId"], "key-1");
        assert_eq!(info["p_b64u"], shamir.p_b64u());
        assert_eq!(info["graceKeyIds"], json!([]));
    }

    #[tokio::test]
    async fn test_threshold_store_ops() {
        let app = app(&small_group(), false);

        let (status, body) = post(
            &app,
            "/threshold/store",
            json!({ "op": "set", "key": "nonce:1", "value": {"n": 1}, "ttlMs": 60000 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let (_, body) = post(&app, "/threshold/store", json!({ "op": "getdel", "key": "nonce:1" })).await;
        assert_eq!(body["value"]["n"], 1);

        let (status, body) = post(
            &app,
            "/threshold/store",
            json!({ "op": "authConsumeUse", "key": "threshold-auth:missing" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], false);
        assert_eq!(body["code"], "UNAUTHORIZED");
        assert_eq!(body["reason"], "not_found");
    }
}
