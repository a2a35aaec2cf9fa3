//! Worker Message Channel
//!
//! Request/response correlation between the page context and an isolated
//! worker context. Every outbound request registers a oneshot sender under
//! its `requestId`; inbound responses are routed to that sender and anything
//! else is dropped.
//!
//! ```text
//! WorkerChannel::send ──post──▶ worker
//!        ▲                         │
//!        └── ResponseRouter ◀──────┘ deliver(response)
//! ```
//!
//! Waits settle on a matching success/error response, on abort, or on the
//! per-request timeout, whichever comes first. Progress responses are
//! forwarded to an optional sink and never settle a wait.

pub mod guard;
pub mod message;
pub mod signal;

pub use message::{
    ResponseStatus, WorkerErrorBody, WorkerRequest, WorkerRequestType, WorkerResponse,
    SCHEMA_VERSION,
};
pub use signal::{AbortController, AbortSignal};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::logging::log_security_event;

/// Default wait for a worker reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error codes workers put in `status: error` responses
pub mod error_codes {
    pub const MALFORMED_REQUEST: &str = "MALFORMED_REQUEST";
    pub const FORBIDDEN_FIELD: &str = "FORBIDDEN_FIELD";
    pub const VRF_NOT_ACTIVE: &str = "VRF_NOT_ACTIVE";
    pub const ACCOUNT_MISMATCH: &str = "ACCOUNT_MISMATCH";
    pub const CHALLENGE_MISMATCH: &str = "CHALLENGE_MISMATCH";
    pub const DECRYPTION_FAILED: &str = "DECRYPTION_FAILED";
    pub const ESCROW_DISABLED: &str = "ESCROW_DISABLED";
    pub const ESCROW_TRANSPORT: &str = "ESCROW_TRANSPORT";
    pub const ESCROW_FAILED: &str = "ESCROW_FAILED";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Worker channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("forbidden secret field in payload: {path}")]
    ForbiddenField { path: String },

    #[error("request {request_id} cancelled")]
    Cancelled { request_id: String },

    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("request id already in flight: {0}")]
    DuplicateRequestId(String),

    #[error("worker channel closed")]
    Closed,

    #[error("worker error [{code}]: {message}")]
    Worker { code: String, message: String },

    #[error("invalid response payload: {0}")]
    InvalidResponse(String),
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::MalformedRequest(_)
            | ChannelError::MissingField(_)
            | ChannelError::DuplicateRequestId(_) => ErrorKind::MalformedInput,
            ChannelError::ForbiddenField { .. } => ErrorKind::SecurityGuard,
            ChannelError::Cancelled { .. } => ErrorKind::UserCancelled,
            ChannelError::Timeout { .. } | ChannelError::Closed => ErrorKind::Transport,
            ChannelError::Worker { code, .. } => match code.as_str() {
                error_codes::MALFORMED_REQUEST => ErrorKind::MalformedInput,
                error_codes::FORBIDDEN_FIELD => ErrorKind::SecurityGuard,
                error_codes::ESCROW_DISABLED => ErrorKind::EscrowDisabled,
                error_codes::ESCROW_TRANSPORT => ErrorKind::Transport,
                _ => ErrorKind::Internal,
            },
            ChannelError::InvalidResponse(_) => ErrorKind::Internal,
        }
    }

    /// Worker-side error code, if the worker produced this error
    pub fn worker_code(&self) -> Option<&str> {
        match self {
            ChannelError::Worker { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Outbound half: how requests reach the worker
pub trait WorkerTransport: Send + Sync {
    fn post(&self, request: WorkerRequest) -> Result<(), ChannelError>;
}

impl WorkerTransport for mpsc::UnboundedSender<WorkerRequest> {
    fn post(&self, request: WorkerRequest) -> Result<(), ChannelError> {
        self.send(request).map_err(|_| ChannelError::Closed)
    }
}

/// Per-request knobs
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub timeout: Option<Duration>,
    pub abort: Option<AbortSignal>,
    pub progress: Option<mpsc::UnboundedSender<WorkerResponse>>,
}

impl SendOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn with_progress(mut self, sink: mpsc::UnboundedSender<WorkerResponse>) -> Self {
        self.progress = Some(sink);
        self
    }
}

struct PendingRequest {
    /// Identifies the wait that registered this entry
    token: u64,
    reply: oneshot::Sender<WorkerResponse>,
    progress: Option<mpsc::UnboundedSender<WorkerResponse>>,
}

/// Inbound half: routes worker responses to pending waits
#[derive(Clone, Default)]
pub struct ResponseRouter {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    next_token: Arc<AtomicU64>,
}

impl ResponseRouter {
    fn table(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Route a response; returns whether a pending wait consumed it
    pub fn deliver(&self, response: WorkerResponse) -> bool {
        if response.schema_version != SCHEMA_VERSION {
            warn!(
                request_id = %response.request_id,
                schema_version = response.schema_version,
                "dropping worker response with unsupported schema version"
            );
            return false;
        }

        let mut pending = self.table();
        match response.status {
            ResponseStatus::Progress => match pending.get(&response.request_id) {
                Some(entry) => {
                    if let Some(sink) = &entry.progress {
                        let _ = sink.send(response);
                    }
                    true
                }
                None => {
                    debug!(request_id = %response.request_id, "dropping unmatched progress");
                    false
                }
            },
            ResponseStatus::Success | ResponseStatus::Error => {
                match pending.remove(&response.request_id) {
                    Some(entry) => {
                        // Receiver gone means the wait already settled.
                        let _ = entry.reply.send(response);
                        true
                    }
                    None => {
                        debug!(request_id = %response.request_id, "dropping unmatched response");
                        false
                    }
                }
            }
        }
    }

    /// Route a raw JSON message; malformed input is dropped
    pub fn deliver_json(&self, raw: &str) -> bool {
        match serde_json::from_str::<WorkerResponse>(raw) {
            Ok(response) => self.deliver(response),
            Err(e) => {
                debug!(error = %e, "dropping malformed worker response");
                false
            }
        }
    }

    /// Insert a pending wait; the guard removes it again on drop
    fn register<'a>(
        &'a self,
        request_id: &'a str,
        reply: oneshot::Sender<WorkerResponse>,
        progress: Option<mpsc::UnboundedSender<WorkerResponse>>,
    ) -> Result<Registration<'a>, ChannelError> {
        let mut pending = self.table();
        if pending.contains_key(request_id) {
            return Err(ChannelError::DuplicateRequestId(request_id.to_string()));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        pending.insert(
            request_id.to_string(),
            PendingRequest {
                token,
                reply,
                progress,
            },
        );
        Ok(Registration {
            router: self,
            request_id,
            token,
        })
    }

    /// Only removes the entry `token` registered, never a newer wait on the same id
    fn deregister(&self, request_id: &str, token: u64) {
        let mut pending = self.table();
        if pending.get(request_id).is_some_and(|entry| entry.token == token) {
            pending.remove(request_id);
        }
    }
}

/// Removes the pending entry however the wait ends
struct Registration<'a> {
    router: &'a ResponseRouter,
    request_id: &'a str,
    token: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.router.deregister(self.request_id, self.token);
    }
}

/// Page-side handle to one worker
#[derive(Clone)]
pub struct WorkerChannel {
    transport: Arc<dyn WorkerTransport>,
    router: ResponseRouter,
    default_timeout: Duration,
}

impl WorkerChannel {
    pub fn new(transport: Arc<dyn WorkerTransport>) -> Self {
        Self::with_router(transport, ResponseRouter::default())
    }

    /// Share a router with the worker that answers on it
    pub fn with_router(transport: Arc<dyn WorkerTransport>, router: ResponseRouter) -> Self {
        Self {
            transport,
            router,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn router(&self) -> ResponseRouter {
        self.router.clone()
    }

    /// Number of requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.router.table().len()
    }

    /// Inbound path; see [`ResponseRouter::deliver`]
    pub fn deliver(&self, response: WorkerResponse) -> bool {
        self.router.deliver(response)
    }

    /// Post a request and wait for its matching response
    pub async fn send(
        &self,
        request: WorkerRequest,
        options: SendOptions,
    ) -> Result<WorkerResponse, ChannelError> {
        if request.request_id.trim().is_empty() {
            return Err(ChannelError::MissingField("requestId"));
        }

        if let Some(path) = guard::find_forbidden_field(&request.payload) {
            log_security_event(
                "forbidden_field_blocked",
                false,
                serde_json::json!({
                    "path": path,
                    "type": request.request_type.name(),
                }),
                Some(&request.request_id),
            );
            return Err(ChannelError::ForbiddenField { path });
        }

        let SendOptions {
            timeout,
            abort,
            progress,
        } = options;
        let request_id = request.request_id.clone();
        let request_type = request.request_type;

        if abort.as_ref().is_some_and(AbortSignal::is_aborted) {
            return Err(ChannelError::Cancelled { request_id });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let _registration = self.router.register(&request_id, reply_tx, progress)?;

        self.transport.post(request)?;
        debug!(request_id = %request_id, request_type = %request_type, "posted worker request");

        let timeout = timeout.unwrap_or(self.default_timeout);
        let cancelled = async move {
            match abort {
                Some(mut signal) => signal.aborted().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => {
                debug!(request_id = %request_id, "worker request cancelled");
                Err(ChannelError::Cancelled { request_id: request_id.clone() })
            }
            outcome = tokio::time::timeout(timeout, reply_rx) => match outcome {
                Err(_) => {
                    warn!(request_id = %request_id, request_type = %request_type, "worker request timed out");
                    Err(ChannelError::Timeout {
                        request_id: request_id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
                Ok(Err(_)) => Err(ChannelError::Closed),
                Ok(Ok(response)) => response.into_result(),
            }
        }
    }

    /// Entry point for untyped JSON requests
    pub async fn send_json(
        &self,
        raw: &str,
        options: SendOptions,
    ) -> Result<WorkerResponse, ChannelError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ChannelError::MalformedRequest(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| ChannelError::MalformedRequest("request must be an object".into()))?;

        match object.get("requestId") {
            Some(Value::String(id)) if !id.trim().is_empty() => {}
            _ => return Err(ChannelError::MissingField("requestId")),
        }
        if object.get("type").map_or(true, Value::is_null) {
            return Err(ChannelError::MissingField("type"));
        }

        let request: WorkerRequest = serde_json::from_value(value)
            .map_err(|e| ChannelError::MalformedRequest(e.to_string()))?;
        self.send(request, options).await
    }

    /// Typed convenience over [`send`](Self::send) with a fresh request id
    pub async fn request<T: DeserializeOwned>(
        &self,
        request_type: WorkerRequestType,
        payload: impl Serialize,
        options: SendOptions,
    ) -> Result<T, ChannelError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ChannelError::MalformedRequest(e.to_string()))?;
        let response = self
            .send(WorkerRequest::new(request_type, payload), options)
            .await?;
        response.parse_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel() -> (WorkerChannel, mpsc::UnboundedReceiver<WorkerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerChannel::new(Arc::new(tx)), rx)
    }

    fn status_request(id: &str) -> WorkerRequest {
        WorkerRequest::new(WorkerRequestType::CheckVrfStatus, json!({})).with_request_id(id)
    }

    #[test]
    fn test_stale_registration_keeps_newer_wait() {
        let router = ResponseRouter::default();

        let (first_tx, _first_rx) = oneshot::channel();
        let stale = router.register("req-1", first_tx, None).unwrap();
        // Response arrives and settles the first wait before its guard drops
        assert!(router.deliver(WorkerResponse::success("req-1", json!({}))));

        let (second_tx, mut second_rx) = oneshot::channel();
        let current = router.register("req-1", second_tx, None).unwrap();

        drop(stale);
        assert_eq!(router.table().len(), 1);
        assert!(router.deliver(WorkerResponse::success("req-1", json!({"ok": true}))));
        assert!(second_rx.try_recv().is_ok());

        drop(current);
        assert!(router.table().is_empty());
    }

    #[tokio::test]
    async fn test_matching_response_resolves() {
        let (channel, mut posted) = channel();
        let sender = channel.clone();
        let wait = tokio::spawn(async move {
            sender
                .send(status_request("req-1"), SendOptions::default())
                .await
        });

        let request = posted.recv().await.unwrap();
        assert_eq!(request.request_id, "req-1");
        assert!(channel.deliver(WorkerResponse::success("req-1", json!({"active": false}))));

        let response = wait.await.unwrap().unwrap();
        assert_eq!(response.data.unwrap()["active"], false);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_never_settles() {
        let (channel, mut posted) = channel();
        let sender = channel.clone();
        let wait = tokio::spawn(async move {
            sender
                .send(status_request("req-1"), SendOptions::default())
                .await
        });
        posted.recv().await.unwrap();

        assert!(!channel.deliver(WorkerResponse::success("other", json!({"stray": true}))));
        assert!(!channel.router().deliver_json("{not json"));
        tokio::task::yield_now().await;
        assert!(!wait.is_finished());
        assert_eq!(channel.pending_count(), 1);

        channel.deliver(WorkerResponse::success("req-1", json!({"ok": true})));
        let response = wait.await.unwrap().unwrap();
        assert_eq!(response.data.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_forbidden_field_never_posted() {
        let (channel, mut posted) = channel();
        let request = WorkerRequest::new(
            WorkerRequestType::UnlockVrfKeypair,
            json!({"accountId": "alice.near", "nested": {"private_key": "ed25519:..."}}),
        );

        let err = channel.send(request, SendOptions::default()).await.unwrap_err();
        match err {
            ChannelError::ForbiddenField { path } => assert_eq!(path, "payload.nested.private_key"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(posted.try_recv().is_err());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_before_send() {
        let (channel, mut posted) = channel();
        let controller = AbortController::new();
        controller.abort();

        let err = channel
            .send(
                status_request("req-1"),
                SendOptions::default().with_abort(controller.signal()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Cancelled { .. }));
        assert_eq!(err.kind(), ErrorKind::UserCancelled);
        assert!(posted.try_recv().is_err());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_during_wait_deregisters() {
        let (channel, mut posted) = channel();
        let controller = AbortController::new();
        let sender = channel.clone();
        let signal = controller.signal();
        let wait = tokio::spawn(async move {
            sender
                .send(status_request("req-1"), SendOptions::default().with_abort(signal))
                .await
        });

        posted.recv().await.unwrap();
        assert_eq!(channel.pending_count(), 1);
        controller.abort();

        assert!(matches!(
            wait.await.unwrap(),
            Err(ChannelError::Cancelled { .. })
        ));
        assert_eq!(channel.pending_count(), 0);
        // A late reply is dropped quietly.
        assert!(!channel.deliver(WorkerResponse::success("req-1", json!({}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deregisters() {
        let (channel, _posted) = channel();
        let err = channel
            .send(
                status_request("req-1"),
                SendOptions::default().with_timeout(Duration::from_millis(250)),
            )
            .await
            .unwrap_err();

        match err {
            ChannelError::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 250),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_forwarded_without_settling() {
        let (channel, mut posted) = channel();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let sender = channel.clone();
        let wait = tokio::spawn(async move {
            sender
                .send(
                    status_request("req-1"),
                    SendOptions::default().with_progress(progress_tx),
                )
                .await
        });
        posted.recv().await.unwrap();

        assert!(channel.deliver(WorkerResponse::progress("req-1", "unlock", "decrypting")));
        let update = progress_rx.recv().await.unwrap();
        assert_eq!(update.status, ResponseStatus::Progress);
        assert!(!wait.is_finished());

        channel.deliver(WorkerResponse::success("req-1", json!({})));
        assert!(wait.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_worker_error_response() {
        let (channel, mut posted) = channel();
        let sender = channel.clone();
        let wait = tokio::spawn(async move {
            sender
                .send(status_request("req-1"), SendOptions::default())
                .await
        });
        posted.recv().await.unwrap();
        channel.deliver(WorkerResponse::failure(
            "req-1",
            error_codes::ESCROW_DISABLED,
            "server lock unavailable",
        ));

        let err = wait.await.unwrap().unwrap_err();
        assert_eq!(err.worker_code(), Some(error_codes::ESCROW_DISABLED));
        assert_eq!(err.kind(), ErrorKind::EscrowDisabled);
    }

    #[tokio::test]
    async fn test_send_json_validation() {
        let (channel, mut posted) = channel();

        let err = channel.send_json("{oops", SendOptions::default()).await.unwrap_err();
        assert!(matches!(err, ChannelError::MalformedRequest(_)));

        let err = channel
            .send_json(r#"{"type": "PING"}"#, SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::MissingField("requestId")));

        let err = channel
            .send_json(r#"{"requestId": "r1", "payload": {}}"#, SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::MissingField("type")));

        let err = channel
            .send_json(r#"{"requestId": "r1", "type": "NOT_A_TYPE"}"#, SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::MalformedRequest(_)));

        assert!(posted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let (channel, mut posted) = channel();
        let sender = channel.clone();
        let first = tokio::spawn(async move {
            sender
                .send(status_request("dup"), SendOptions::default())
                .await
        });
        posted.recv().await.unwrap();

        let err = channel
            .send(status_request("dup"), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::DuplicateRequestId(_)));
        // The first wait is still registered.
        assert_eq!(channel.pending_count(), 1);

        channel.deliver(WorkerResponse::success("dup", json!({})));
        assert!(first.await.unwrap().is_ok());
    }
}
