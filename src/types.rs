//! Request and response types for the relay HTTP API

use serde::{Deserialize, Serialize};

/// Apply-server-lock request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyServerLockRequest {
    /// Client-locked KEK (base64url big-endian integer)
    pub kek_c_b64u: String,
}

/// Apply-server-lock response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyServerLockResponse {
    /// Double-locked KEK
    pub kek_cs_b64u: String,
    /// Id of the server key that applied the lock
    #[serde(rename = "keyId")]
    pub key_id: String,
}

/// Remove-server-lock request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveServerLockRequest {
    /// Double-locked KEK
    pub kek_cs_b64u: String,
    /// Server key that applied the lock; current key when absent
    #[serde(rename = "keyId", default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Remove-server-lock response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveServerLockResponse {
    /// KEK with only the client lock left
    pub kek_c_b64u: String,
}

/// Generic error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Whether the relay can apply server locks
    pub shamir_apply_enabled: bool,
    /// Whether the relay can remove server locks
    pub shamir_remove_enabled: bool,
    /// Current Shamir key id, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}
