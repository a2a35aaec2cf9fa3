//! Request/response envelope for the `/threshold/store` surface.
//!
//! One POST body carries one operation. Failures are returned in-band as
//! `{ok:false, code, message}` so callers see the store's verdict even when
//! the HTTP layer succeeded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::ThresholdStore;
use super::{ThresholdAuthEntry, ThresholdStoreError, UnauthorizedReason};

/// Keys under this prefix hold [`ThresholdAuthEntry`] values
pub const AUTH_KEY_PREFIX: &str = "threshold-auth:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreOp {
    Get,
    Set,
    Del,
    Getdel,
    AuthConsumeUse,
    AuthConsumeUseCount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    pub op: StoreOp,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set on `UNAUTHORIZED` refusals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnauthorizedReason>,
}

impl StoreResponse {
    pub fn ok(value: Option<Value>) -> Self {
        Self {
            ok: true,
            value,
            code: None,
            message: None,
            reason: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            code: Some(code.into()),
            message: Some(message.into()),
            reason: None,
        }
    }
}

impl From<ThresholdStoreError> for StoreResponse {
    fn from(err: ThresholdStoreError) -> Self {
        let mut response = StoreResponse::error(err.code(), err.to_string());
        if let ThresholdStoreError::Unauthorized(reason) = err {
            response.reason = Some(reason);
        }
        response
    }
}

/// Run one store request
pub async fn execute(store: &dyn ThresholdStore, request: StoreRequest) -> StoreResponse {
    if request.key.trim().is_empty() {
        return StoreResponse::error("INVALID_KEY", "key is required");
    }

    let result = match request.op {
        StoreOp::Get => store.get(&request.key).await,
        StoreOp::Getdel => store.getdel(&request.key).await,
        StoreOp::Del => store
            .del(&request.key)
            .await
            .map(|existed| Some(Value::Bool(existed))),
        StoreOp::Set => set(store, &request).await.map(|_| None),
        StoreOp::AuthConsumeUse => store.consume_use(&request.key).await.and_then(|outcome| {
            serde_json::to_value(outcome)
                .map(Some)
                .map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))
        }),
        StoreOp::AuthConsumeUseCount => store
            .consume_use_count(&request.key)
            .await
            .map(|remaining| Some(serde_json::json!({ "remainingUses": remaining }))),
    };

    match result {
        Ok(value) => StoreResponse::ok(value),
        Err(err) => err.into(),
    }
}

async fn set(store: &dyn ThresholdStore, request: &StoreRequest) -> Result<(), ThresholdStoreError> {
    let value = request
        .value
        .clone()
        .ok_or_else(|| ThresholdStoreError::InvalidData("value is required for set".to_string()))?;

    if request.key.starts_with(AUTH_KEY_PREFIX) {
        // Auth entries carry their own deadline; a caller ttlMs is ignored.
        let entry: ThresholdAuthEntry = serde_json::from_value(value)
            .map_err(|e| ThresholdStoreError::InvalidData(e.to_string()))?;
        return store.put_auth_entry(&request.key, &entry).await;
    }

    store.set(&request.key, value, request.ttl_ms).await
}
