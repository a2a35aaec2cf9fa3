//! HTTP client for a remote threshold store
//!
//! Lets the lifecycle orchestrator spend authorizations held by a relay's
//! `/threshold/store` endpoint.

use async_trait::async_trait;
use std::time::Duration;

use super::ops::{StoreOp, StoreRequest, StoreResponse};
use super::traits::{ThresholdAuthorizer, ThresholdResult};
use super::{ThresholdStoreError, UnauthorizedReason};

/// Threshold authorizer backed by a relay over HTTP
pub struct HttpThresholdAuthorizer {
    /// Relay base URL, without trailing slash
    relay_url: String,
    http_client: reqwest::Client,
}

impl HttpThresholdAuthorizer {
    pub fn new(relay_url: impl Into<String>) -> ThresholdResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ThresholdStoreError::Connection(e.to_string()))?;

        Ok(Self {
            relay_url: relay_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Send one store request and return the relay's verdict
    pub async fn call(&self, request: &StoreRequest) -> ThresholdResult<StoreResponse> {
        self.http_client
            .post(format!("{}/threshold/store", self.relay_url))
            .json(request)
            .send()
            .await
            .map_err(|e| ThresholdStoreError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ThresholdStoreError::Transport(format!("invalid store response: {}", e)))
    }
}

/// Map an in-band failure back onto the store error it came from
fn response_error(response: &StoreResponse) -> ThresholdStoreError {
    let message = response.message.clone().unwrap_or_default();
    match response.code.as_deref() {
        // A refusal without a reason still ends the session
        Some("UNAUTHORIZED") => ThresholdStoreError::Unauthorized(
            response.reason.unwrap_or(UnauthorizedReason::Exhausted),
        ),
        Some("INVALID_DATA") | Some("INVALID_KEY") => ThresholdStoreError::InvalidData(message),
        Some(code) => ThresholdStoreError::Transport(format!("{}: {}", code, message)),
        None => ThresholdStoreError::Transport(message),
    }
}

#[async_trait]
impl ThresholdAuthorizer for HttpThresholdAuthorizer {
    async fn consume_use(&self, session_key: &str) -> ThresholdResult<u32> {
        let request = StoreRequest {
            op: StoreOp::AuthConsumeUseCount,
            key: session_key.to_string(),
            value: None,
            ttl_ms: None,
        };
        let response = self.call(&request).await?;
        if !response.ok {
            return Err(response_error(&response));
        }

        response
            .value
            .as_ref()
            .and_then(|v| v.get("remainingUses"))
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .ok_or_else(|| ThresholdStoreError::InvalidData("missing remainingUses".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_error_mapping() {
        let expired = StoreResponse::from(ThresholdStoreError::Unauthorized(
            UnauthorizedReason::Expired,
        ));
        assert_eq!(expired.reason, Some(UnauthorizedReason::Expired));
        assert!(matches!(
            response_error(&expired),
            ThresholdStoreError::Unauthorized(UnauthorizedReason::Expired)
        ));

        // Reason travels as a field; the message text is not consulted
        let mut not_found = StoreResponse::error("UNAUTHORIZED", "authorization expired");
        not_found.reason = Some(UnauthorizedReason::NotFound);
        assert!(matches!(
            response_error(&not_found),
            ThresholdStoreError::Unauthorized(UnauthorizedReason::NotFound)
        ));

        let bare = StoreResponse::error("UNAUTHORIZED", "refused");
        assert!(matches!(
            response_error(&bare),
            ThresholdStoreError::Unauthorized(UnauthorizedReason::Exhausted)
        ));

        let db = StoreResponse::error("DATABASE_ERROR", "locked");
        assert!(matches!(response_error(&db), ThresholdStoreError::Transport(_)));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = HttpThresholdAuthorizer::new("http://relay.local/").unwrap();
        assert_eq!(client.relay_url, "http://relay.local");
    }
}
