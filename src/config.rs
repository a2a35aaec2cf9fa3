//! Environment-based Configuration for the VRF Relay
//!
//! Secrets (server exponents) come from environment variables or an
//! encrypted keystore file, never from hardcoded values. A TOML file can
//! supply the same settings for local deployments.
//!
//! # Environment Variables
//!
//! ## Server
//! - `VRF_RELAY_BIND` - listen address (default: "0.0.0.0:9090")
//! - `VRF_RELAY_ALLOWED_ORIGINS` - comma separated CORS origins
//!
//! ## Shamir escrow
//! - `VRF_RELAY_SHAMIR_P_B64U` - prime modulus (default: RFC 3526 2048-bit MODP)
//! - `VRF_RELAY_SHAMIR_E_S_B64U` - server lock exponent
//! - `VRF_RELAY_SHAMIR_D_S_B64U` - server unlock exponent
//! - `VRF_RELAY_SHAMIR_KEY_ID` - id of the current key (derived from `e_s` when unset)
//! - `VRF_RELAY_SHAMIR_GRACE_KEYS_FILE` - TOML file listing retired keys
//! - `VRF_RELAY_SHAMIR_GRACE_PERIOD_SECS` - retention for rotated keys (default: 86400)
//!
//! Either exponent may be absent; the operation needing it then fails closed.
//!
//! ## Threshold store
//! - `VRF_RELAY_THRESHOLD_DB_PATH` - SQLite file (in-memory store when unset)
//! - `VRF_RELAY_THRESHOLD_CLIENT_PARTICIPANT_ID` - default: 1
//! - `VRF_RELAY_THRESHOLD_RELAYER_PARTICIPANT_ID` - default: 2
//!
//! ## Logging
//! - `VRF_RELAY_LOG_LEVEL` - trace, debug, info, warn, error (default: info)
//! - `VRF_RELAY_LOG_JSON` - "1" for JSON output

use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;

use crate::threshold::ParticipantSet;

pub const DEFAULT_BIND: &str = "0.0.0.0:9090";
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 86_400;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("failed to read config file {0}: {1}")]
    FileRead(String, String),

    #[error("failed to parse config file {0}: {1}")]
    FileParse(String, String),
}

/// Shamir escrow settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShamirConfig {
    pub p_b64u: Option<String>,
    pub e_s_b64u: Option<String>,
    pub d_s_b64u: Option<String>,
    pub key_id: Option<String>,
    /// Encrypted keystore holding `e_s`/`d_s` (see `generate-keys`)
    pub key_file: Option<String>,
    pub grace_keys_file: Option<String>,
    pub grace_period_secs: Option<u64>,
}

impl ShamirConfig {
    pub fn grace_period_secs(&self) -> u64 {
        self.grace_period_secs.unwrap_or(DEFAULT_GRACE_PERIOD_SECS)
    }
}

/// Threshold store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub db_path: Option<String>,
    pub client_participant_id: u16,
    pub relayer_participant_id: u16,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            client_participant_id: 1,
            relayer_participant_id: 2,
        }
    }
}

impl ThresholdConfig {
    pub fn participants(&self) -> ParticipantSet {
        ParticipantSet::new(self.client_participant_id, self.relayer_participant_id)
    }
}

/// Relay server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub allowed_origins: Vec<String>,
    pub shamir: ShamirConfig,
    pub threshold: ThresholdConfig,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            shamir: ShamirConfig::default(),
            threshold: ThresholdConfig::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then let environment variables override it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(display.clone(), e.to_string()))?;
        let mut config: RelayConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::FileParse(display, e.to_string()))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(bind) = env::var("VRF_RELAY_BIND") {
            self.bind = bind;
        }
        if let Ok(origins) = env::var("VRF_RELAY_ALLOWED_ORIGINS") {
            self.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        override_opt(&mut self.shamir.p_b64u, "VRF_RELAY_SHAMIR_P_B64U");
        override_opt(&mut self.shamir.e_s_b64u, "VRF_RELAY_SHAMIR_E_S_B64U");
        override_opt(&mut self.shamir.d_s_b64u, "VRF_RELAY_SHAMIR_D_S_B64U");
        override_opt(&mut self.shamir.key_id, "VRF_RELAY_SHAMIR_KEY_ID");
        override_opt(&mut self.shamir.key_file, "VRF_RELAY_SHAMIR_KEY_FILE");
        override_opt(
            &mut self.shamir.grace_keys_file,
            "VRF_RELAY_SHAMIR_GRACE_KEYS_FILE",
        );
        if let Some(secs) = parse_env::<u64>("VRF_RELAY_SHAMIR_GRACE_PERIOD_SECS")? {
            self.shamir.grace_period_secs = Some(secs);
        }

        override_opt(&mut self.threshold.db_path, "VRF_RELAY_THRESHOLD_DB_PATH");
        if let Some(id) = parse_env::<u16>("VRF_RELAY_THRESHOLD_CLIENT_PARTICIPANT_ID")? {
            self.threshold.client_participant_id = id;
        }
        if let Some(id) = parse_env::<u16>("VRF_RELAY_THRESHOLD_RELAYER_PARTICIPANT_ID")? {
            self.threshold.relayer_participant_id = id;
        }

        if let Ok(level) = env::var("VRF_RELAY_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(json) = env::var("VRF_RELAY_LOG_JSON") {
            self.log_json = json == "1" || json.eq_ignore_ascii_case("true");
        }

        Ok(())
    }

    /// Reject configurations that cannot serve any request correctly
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold.client_participant_id == self.threshold.relayer_participant_id {
            return Err(ConfigError::InvalidValue(
                "VRF_RELAY_THRESHOLD_RELAYER_PARTICIPANT_ID".to_string(),
                "client and relayer participant ids must differ".to_string(),
            ));
        }
        if self.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue(
                "VRF_RELAY_BIND".to_string(),
                format!("not a socket address: {}", self.bind),
            ));
        }
        Ok(())
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== VRF Relay Configuration ===");
        println!("Bind: {}", self.bind);
        println!(
            "Shamir modulus: {}",
            if self.shamir.p_b64u.is_some() { "custom" } else { "RFC 3526 MODP-2048" }
        );
        println!("Shamir e_s: {}", presence(self.shamir.e_s_b64u.is_some()));
        println!("Shamir d_s: {}", presence(self.shamir.d_s_b64u.is_some()));
        println!("Shamir key file: {}", presence(self.shamir.key_file.is_some()));
        println!(
            "Threshold store: {}",
            self.threshold.db_path.as_deref().unwrap_or("in-memory")
        );
        println!(
            "Threshold participants: client={} relayer={}",
            self.threshold.client_participant_id, self.threshold.relayer_participant_id
        );
        println!("Log Level: {}", self.log_level);
        println!("===============================");
    }
}

fn presence(set: bool) -> &'static str {
    if set {
        "configured"
    } else {
        "not configured"
    }
}

fn override_opt(slot: &mut Option<String>, var_name: &str) {
    if let Ok(value) = env::var(var_name) {
        if !value.trim().is_empty() {
            *slot = Some(value.trim().to_string());
        }
    }
}

fn parse_env<T: std::str::FromStr>(var_name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var_name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(var_name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}
