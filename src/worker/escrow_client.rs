//! Client side of the relay's escrow endpoints
//!
//! The worker only ever hands the relay client-locked or double-locked
//! values; the KEK itself never leaves the worker.

use async_trait::async_trait;
use std::time::Duration;

use crate::escrow::{ClientLocked, DoubleLocked, EscrowError, ShamirEscrowService};
use crate::types::{
    ApplyServerLockRequest, ApplyServerLockResponse, ErrorResponse, RemoveServerLockRequest,
    RemoveServerLockResponse,
};

/// Server half of the three-pass protocol as seen by the worker
#[async_trait]
pub trait EscrowClient: Send + Sync {
    /// Returns the double-locked value and the server key id
    async fn apply_server_lock(
        &self,
        kek_c: &ClientLocked,
    ) -> Result<(DoubleLocked, String), EscrowError>;

    async fn remove_server_lock(
        &self,
        kek_cs: &DoubleLocked,
        key_id: Option<&str>,
    ) -> Result<ClientLocked, EscrowError>;
}

/// In-process relay, for single-binary deployments and tests
#[async_trait]
impl EscrowClient for ShamirEscrowService {
    async fn apply_server_lock(
        &self,
        kek_c: &ClientLocked,
    ) -> Result<(DoubleLocked, String), EscrowError> {
        ShamirEscrowService::apply_server_lock(self, kek_c).await
    }

    async fn remove_server_lock(
        &self,
        kek_cs: &DoubleLocked,
        key_id: Option<&str>,
    ) -> Result<ClientLocked, EscrowError> {
        ShamirEscrowService::remove_server_lock(self, kek_cs, key_id).await
    }
}

/// Relay reached over HTTP
pub struct HttpEscrowClient {
    /// Relay base URL, without trailing slash
    relay_url: String,
    http_client: reqwest::Client,
}

impl HttpEscrowClient {
    pub fn new(relay_url: impl Into<String>) -> Result<Self, EscrowError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EscrowError::Transport(e.to_string()))?;

        Ok(Self {
            relay_url: relay_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, EscrowError>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let response = self
            .http_client
            .post(format!("{}{}", self.relay_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| EscrowError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error: ErrorResponse = response.json().await.unwrap_or_else(|_| {
                ErrorResponse::new("HTTP_ERROR", format!("relay returned {}", status))
            });
            tracing::warn!(
                path = %path,
                status = %status,
                code = %error.code,
                "Relay rejected escrow request"
            );
            return Err(EscrowError::Rejected {
                code: error.code,
                message: error.message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| EscrowError::Transport(format!("invalid relay response: {}", e)))
    }
}

#[async_trait]
impl EscrowClient for HttpEscrowClient {
    async fn apply_server_lock(
        &self,
        kek_c: &ClientLocked,
    ) -> Result<(DoubleLocked, String), EscrowError> {
        let request = ApplyServerLockRequest {
            kek_c_b64u: kek_c.to_b64u(),
        };
        let response: ApplyServerLockResponse =
            self.post("/vrf/apply-server-lock", &request).await?;
        Ok((DoubleLocked::from_b64u(&response.kek_cs_b64u)?, response.key_id))
    }

    async fn remove_server_lock(
        &self,
        kek_cs: &DoubleLocked,
        key_id: Option<&str>,
    ) -> Result<ClientLocked, EscrowError> {
        let request = RemoveServerLockRequest {
            kek_cs_b64u: kek_cs.to_b64u(),
            key_id: key_id.map(str::to_string),
        };
        let response: RemoveServerLockResponse =
            self.post("/vrf/remove-server-lock", &request).await?;
        ClientLocked::from_b64u(&response.kek_c_b64u)
    }
}
