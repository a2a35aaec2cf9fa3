//! Common Error Types
//!
//! Every component error maps onto an [`ErrorKind`] so callers can decide how
//! to recover without matching on each module's enum.

use serde::Serialize;
use thiserror::Error;

/// Error taxonomy shared by all components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request could not be parsed or is missing required fields
    MalformedInput,
    /// Biometric ceremony or wait aborted by the user
    UserCancelled,
    /// A secret-bearing field was about to cross a boundary
    SecurityGuard,
    /// Timeout or transport failure
    Transport,
    /// Authorization exhausted or expired
    AuthorizationExhausted,
    /// Escrow operation requested without the exponent it needs
    EscrowDisabled,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Stable code used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::MalformedInput => "MALFORMED_INPUT",
            ErrorKind::UserCancelled => "USER_CANCELLED",
            ErrorKind::SecurityGuard => "SECURITY_GUARD",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::AuthorizationExhausted => "AUTHORIZATION_EXHAUSTED",
            ErrorKind::EscrowDisabled => "ESCROW_DISABLED",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same operation can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::UserCancelled)
    }
}

/// Root error type for the crate
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    /// Worker channel errors
    #[error("channel error: {0}")]
    Channel(#[from] crate::channel::ChannelError),

    /// Shamir escrow errors
    #[error("escrow error: {0}")]
    Escrow(#[from] crate::escrow::EscrowError),

    /// Escrow keystore errors
    #[error("keystore error: {0}")]
    Keystore(#[from] crate::escrow::KeystoreError),

    /// Threshold store errors
    #[error("threshold store error: {0}")]
    Threshold(#[from] crate::threshold::ThresholdStoreError),

    /// Lifecycle orchestration errors
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] crate::lifecycle::OrchestratorError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthorityError {
    /// Classify into the shared taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthorityError::Config(_) | AuthorityError::Logging(_) => ErrorKind::Internal,
            AuthorityError::Channel(e) => e.kind(),
            AuthorityError::Escrow(e) => e.kind(),
            AuthorityError::Keystore(_) => ErrorKind::Internal,
            AuthorityError::Threshold(e) => e.kind(),
            AuthorityError::Lifecycle(e) => e.kind(),
            AuthorityError::Io(_) => ErrorKind::Transport,
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthorityError::Config(_) => "CONFIG_ERROR",
            AuthorityError::Logging(_) => "LOGGING_ERROR",
            AuthorityError::Keystore(_) => "KEYSTORE_ERROR",
            AuthorityError::Io(_) => "IO_ERROR",
            other => other.kind().code(),
        }
    }
}

/// Result type alias using AuthorityError
pub type Result<T> = std::result::Result<T, AuthorityError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use crate::escrow::EscrowError;

    #[test]
    fn test_error_codes() {
        let err: AuthorityError = ChannelError::ForbiddenField {
            path: "payload.privateKey".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::SecurityGuard);
        assert_eq!(err.error_code(), "SECURITY_GUARD");

        let err: AuthorityError = EscrowError::Disabled("e_s not configured").into();
        assert_eq!(err.error_code(), "ESCROW_DISABLED");
    }

    #[test]
    fn test_retryable_errors() {
        let timeout: AuthorityError = ChannelError::Timeout {
            request_id: "r1".into(),
            timeout_ms: 10,
        }
        .into();
        assert!(timeout.is_retryable());

        let malformed: AuthorityError = ChannelError::MissingField("type").into();
        assert!(!malformed.is_retryable());
    }
}
