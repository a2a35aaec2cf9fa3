//! Worker request/response envelopes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChannelError;

/// Envelope version understood by both sides of the channel
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Request types handled by the VRF worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerRequestType {
    Ping,
    UnlockVrfKeypair,
    Shamir3passClientDecryptVrfKeypair,
    GenerateVrfKeypairBootstrap,
    EncryptVrfKeypairWithPrf,
    Shamir3passClientEncryptCurrentVrfKeypair,
    GenerateVrfChallenge,
    MintSigningSession,
    CheckVrfStatus,
    Logout,
}

impl WorkerRequestType {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerRequestType::Ping => "PING",
            WorkerRequestType::UnlockVrfKeypair => "UNLOCK_VRF_KEYPAIR",
            WorkerRequestType::Shamir3passClientDecryptVrfKeypair => {
                "SHAMIR3PASS_CLIENT_DECRYPT_VRF_KEYPAIR"
            }
            WorkerRequestType::GenerateVrfKeypairBootstrap => "GENERATE_VRF_KEYPAIR_BOOTSTRAP",
            WorkerRequestType::EncryptVrfKeypairWithPrf => "ENCRYPT_VRF_KEYPAIR_WITH_PRF",
            WorkerRequestType::Shamir3passClientEncryptCurrentVrfKeypair => {
                "SHAMIR3PASS_CLIENT_ENCRYPT_CURRENT_VRF_KEYPAIR"
            }
            WorkerRequestType::GenerateVrfChallenge => "GENERATE_VRF_CHALLENGE",
            WorkerRequestType::MintSigningSession => "MINT_SIGNING_SESSION",
            WorkerRequestType::CheckVrfStatus => "CHECK_VRF_STATUS",
            WorkerRequestType::Logout => "LOGOUT",
        }
    }
}

impl std::fmt::Display for WorkerRequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Message posted to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub request_id: String,
    #[serde(rename = "type")]
    pub request_type: WorkerRequestType,
    #[serde(default)]
    pub payload: Value,
}

impl WorkerRequest {
    /// Build a request with a fresh UUID v4 request id
    pub fn new(request_type: WorkerRequestType, payload: Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            request_id: uuid::Uuid::new_v4().to_string(),
            request_type,
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Decode the payload into the handler's typed view
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ChannelError::MalformedRequest(format!("{} payload: {}", self.request_type, e))
        })
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Progress,
}

/// Error body carried by `status: error` responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerErrorBody {
    pub code: String,
    pub message: String,
}

/// Message posted back by a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerErrorBody>,
}

impl WorkerResponse {
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            request_id: request_id.into(),
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            request_id: request_id.into(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(WorkerErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Intermediate progress update; never settles a wait
    pub fn progress(request_id: impl Into<String>, step: &str, message: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            request_id: request_id.into(),
            status: ResponseStatus::Progress,
            data: Some(serde_json::json!({ "step": step, "message": message })),
            error: None,
        }
    }

    /// Turn a terminal response into the caller-facing result
    pub fn into_result(self) -> Result<WorkerResponse, ChannelError> {
        match self.status {
            ResponseStatus::Error => {
                let body = self.error.unwrap_or_else(|| WorkerErrorBody {
                    code: "UNKNOWN".to_string(),
                    message: "worker reported an error without details".to_string(),
                });
                Err(ChannelError::Worker {
                    code: body.code,
                    message: body.message,
                })
            }
            _ => Ok(self),
        }
    }

    /// Decode `data` into `T`; a missing body decodes from `null`
    pub fn parse_data<T: DeserializeOwned>(self) -> Result<T, ChannelError> {
        serde_json::from_value(self.data.unwrap_or(Value::Null))
            .map_err(|e| ChannelError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_wire_names() {
        let json = serde_json::to_string(&WorkerRequestType::Shamir3passClientDecryptVrfKeypair)
            .unwrap();
        assert_eq!(json, "\"SHAMIR3PASS_CLIENT_DECRYPT_VRF_KEYPAIR\"");

        for ty in [
            WorkerRequestType::Ping,
            WorkerRequestType::GenerateVrfKeypairBootstrap,
            WorkerRequestType::EncryptVrfKeypairWithPrf,
            WorkerRequestType::Shamir3passClientEncryptCurrentVrfKeypair,
            WorkerRequestType::MintSigningSession,
        ] {
            let wire = serde_json::to_value(ty).unwrap();
            assert_eq!(wire.as_str(), Some(ty.name()));
        }
    }

    #[test]
    fn test_request_serialization() {
        let request = WorkerRequest::new(
            WorkerRequestType::CheckVrfStatus,
            serde_json::json!({}),
        )
        .with_request_id("req-1");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["type"], "CHECK_VRF_STATUS");
        assert_eq!(json["schemaVersion"], SCHEMA_VERSION);
    }

    #[test]
    fn test_error_response_into_result() {
        let response = WorkerResponse::failure("req-1", "VRF_NOT_ACTIVE", "no keypair loaded");
        match response.into_result() {
            Err(ChannelError::Worker { code, .. }) => assert_eq!(code, "VRF_NOT_ACTIVE"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
