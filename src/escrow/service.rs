//! Server-side escrow key management.
//!
//! The service owns the current exponent pair plus rotated keys that still
//! accept `remove-server-lock` until their grace deadline. Either exponent
//! of the current key may be missing; the operation that needs it then
//! fails closed with [`EscrowError::Disabled`].

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::shamir::{ClientLocked, DoubleLocked, Shamir3Pass};
use super::{decode_biguint_b64u, EscrowError, ServerKeypair};
use crate::clock::Clock;
use crate::config::ShamirConfig;
use crate::logging::log_security_event;

/// Stable short id for a server key, derived from `e_s`
pub fn derive_key_id(e_s: &BigUint) -> String {
    let digest = Sha256::digest(e_s.to_bytes_be());
    hex::encode(&digest[..8])
}

/// Current key; each exponent independently optional
#[derive(Clone)]
pub struct ServerKeyMaterial {
    pub key_id: String,
    pub e_s: Option<BigUint>,
    pub d_s: Option<BigUint>,
}

impl ServerKeyMaterial {
    pub fn from_keypair(key_id: Option<String>, keypair: ServerKeypair) -> Self {
        let key_id = key_id.unwrap_or_else(|| derive_key_id(&keypair.e_s));
        Self {
            key_id,
            e_s: Some(keypair.e_s),
            d_s: Some(keypair.d_s),
        }
    }
}

struct GraceKey {
    key_id: String,
    d_s: BigUint,
    expires_at_ms: u64,
}

/// One entry of a grace keys file
#[derive(Debug, Deserialize)]
struct GraceKeyEntry {
    key_id: String,
    d_s_b64u: String,
    /// Absolute deadline; defaults to now + configured grace period
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GraceKeysFile {
    #[serde(default)]
    keys: Vec<GraceKeyEntry>,
}

fn load_grace_keys(path: &str, default_expiry_ms: u64) -> Result<Vec<GraceKey>, EscrowError> {
    let raw = std::fs::read_to_string(Path::new(path))
        .map_err(|e| EscrowError::InvalidValue(format!("grace keys file {}: {}", path, e)))?;
    let file: GraceKeysFile = toml::from_str(&raw)
        .map_err(|e| EscrowError::InvalidValue(format!("grace keys file {}: {}", path, e)))?;

    file.keys
        .into_iter()
        .map(|entry| {
            Ok(GraceKey {
                key_id: entry.key_id,
                d_s: decode_biguint_b64u(&entry.d_s_b64u)?,
                expires_at_ms: entry.expires_at_ms.unwrap_or(default_expiry_ms),
            })
        })
        .collect()
}

/// Public view served on `GET /shamir/key-info`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub current_key_id: Option<String>,
    #[serde(rename = "p_b64u")]
    pub p_b64u: String,
    pub grace_key_ids: Vec<String>,
    pub apply_lock_enabled: bool,
    pub remove_lock_enabled: bool,
}

/// Relay-side half of the three-pass protocol
pub struct ShamirEscrowService {
    shamir: Shamir3Pass,
    current: RwLock<Option<ServerKeyMaterial>>,
    grace: RwLock<Vec<GraceKey>>,
    clock: Arc<dyn Clock>,
}

impl ShamirEscrowService {
    pub fn new(shamir: Shamir3Pass, current: Option<ServerKeyMaterial>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shamir,
            current: RwLock::new(current),
            grace: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// No exponents at all; every lock operation fails closed
    pub fn disabled(shamir: Shamir3Pass, clock: Arc<dyn Clock>) -> Self {
        Self::new(shamir, None, clock)
    }

    /// Build from configuration; `keystore_keys` wins over env exponents
    pub fn from_config(
        config: &ShamirConfig,
        keystore_keys: Option<(String, ServerKeypair)>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EscrowError> {
        let shamir = match &config.p_b64u {
            Some(p) => Shamir3Pass::from_b64u(p)?,
            None => Shamir3Pass::default(),
        };

        let current = match keystore_keys {
            Some((key_id, keypair)) => Some(ServerKeyMaterial::from_keypair(
                config.key_id.clone().or(Some(key_id)),
                keypair,
            )),
            None => {
                let e_s = config.e_s_b64u.as_deref().map(decode_biguint_b64u).transpose()?;
                let d_s = config.d_s_b64u.as_deref().map(decode_biguint_b64u).transpose()?;
                let key_id = match (&config.key_id, &e_s, &d_s) {
                    (_, None, None) => None,
                    (Some(id), _, _) => Some(id.clone()),
                    (None, Some(e), _) => Some(derive_key_id(e)),
                    // d_s-only deployments derive the same id as their lock peer
                    (None, None, Some(d)) => Some(derive_key_id(&shamir.invert_exponent(d)?)),
                };
                key_id.map(|key_id| ServerKeyMaterial { key_id, e_s, d_s })
            }
        };

        match &current {
            Some(material) => tracing::info!(
                key_id = %material.key_id,
                apply_lock = material.e_s.is_some(),
                remove_lock = material.d_s.is_some(),
                "Shamir escrow configured"
            ),
            None => log_security_event(
                "shamir_disabled",
                false,
                serde_json::json!({"reason": "no server exponents configured"}),
                None,
            ),
        }

        let grace = match &config.grace_keys_file {
            Some(path) => {
                let now = clock.now_ms();
                let keys = load_grace_keys(path, now + config.grace_period_secs() * 1000)?;
                tracing::info!(count = keys.len(), path = %path, "Loaded Shamir grace keys");
                keys
            }
            None => Vec::new(),
        };

        Ok(Self {
            shamir,
            current: RwLock::new(current),
            grace: RwLock::new(grace),
            clock,
        })
    }

    pub fn shamir(&self) -> &Shamir3Pass {
        &self.shamir
    }

    /// Fresh `(e_s, d_s)` with `gcd(e_s, p-1) = 1`
    pub fn generate_server_keypair(&self) -> Result<ServerKeypair, EscrowError> {
        self.shamir.generate_lock_keys().map(ServerKeypair::from)
    }

    /// Returns the double-locked value and the id of the key that locked it
    pub async fn apply_server_lock(
        &self,
        kek_c: &ClientLocked,
    ) -> Result<(DoubleLocked, String), EscrowError> {
        self.shamir.validate_element(kek_c.as_biguint())?;

        let current = self.current.read().await;
        let (key_id, e_s) = match current.as_ref() {
            Some(ServerKeyMaterial {
                key_id,
                e_s: Some(e_s),
                ..
            }) => (key_id.clone(), e_s),
            _ => {
                log_security_event(
                    "shamir_apply_lock_disabled",
                    false,
                    serde_json::json!({"reason": "e_s not configured"}),
                    None,
                );
                return Err(EscrowError::Disabled("apply-server-lock requires e_s"));
            }
        };

        let kek_cs = self.shamir.apply_server_lock(kek_c, e_s);
        tracing::debug!(key_id = %key_id, "Applied server lock");
        Ok((kek_cs, key_id))
    }

    /// Uses the current `d_s`, or a retained one when `key_id` names it
    pub async fn remove_server_lock(
        &self,
        kek_cs: &DoubleLocked,
        key_id: Option<&str>,
    ) -> Result<ClientLocked, EscrowError> {
        self.shamir.validate_element(kek_cs.as_biguint())?;

        let current_can_unlock = {
            let current = self.current.read().await;
            let use_current = match (current.as_ref(), key_id) {
                (_, None) => true,
                (Some(material), Some(requested)) => material.key_id == requested,
                (None, Some(_)) => false,
            };

            if use_current {
                return match current.as_ref().and_then(|m| m.d_s.as_ref()) {
                    Some(d_s) => Ok(self.shamir.remove_server_lock(kek_cs, d_s)),
                    None => {
                        log_security_event(
                            "shamir_remove_lock_disabled",
                            false,
                            serde_json::json!({"reason": "d_s not configured"}),
                            None,
                        );
                        Err(EscrowError::Disabled("remove-server-lock requires d_s"))
                    }
                };
            }
            current.as_ref().is_some_and(|m| m.d_s.is_some())
        };

        let requested = key_id.unwrap_or_default();
        self.prune_grace_keys().await;
        let grace = self.grace.read().await;
        match grace.iter().find(|k| k.key_id == requested) {
            Some(key) => {
                tracing::info!(key_id = %requested, "Removed server lock with grace key");
                Ok(self.shamir.remove_server_lock(kek_cs, &key.d_s))
            }
            None if current_can_unlock => Err(EscrowError::UnknownKeyId(requested.to_string())),
            None => {
                log_security_event(
                    "shamir_remove_lock_disabled",
                    false,
                    serde_json::json!({"reason": "d_s not configured", "key_id": requested}),
                    None,
                );
                Err(EscrowError::Disabled("remove-server-lock requires d_s"))
            }
        }
    }

    /// Install `next` as current; the previous `d_s` stays usable for `grace_period`
    pub async fn rotate(
        &self,
        next: ServerKeypair,
        key_id: Option<String>,
        grace_period: Duration,
    ) -> Result<String, EscrowError> {
        let material = ServerKeyMaterial::from_keypair(key_id, next);
        let new_id = material.key_id.clone();

        let mut current = self.current.write().await;
        if let Some(previous) = current.take() {
            if previous.key_id == new_id {
                *current = Some(previous);
                return Err(EscrowError::InvalidValue(format!(
                    "key id {} is already current",
                    new_id
                )));
            }
            if let Some(d_s) = previous.d_s {
                let expires_at_ms = self.clock.now_ms() + grace_period.as_millis() as u64;
                self.grace.write().await.push(GraceKey {
                    key_id: previous.key_id.clone(),
                    d_s,
                    expires_at_ms,
                });
                tracing::info!(
                    retired_key_id = %previous.key_id,
                    expires_at_ms,
                    "Retained rotated Shamir key"
                );
            }
        }
        *current = Some(material);
        tracing::info!(key_id = %new_id, "Rotated Shamir server key");
        Ok(new_id)
    }

    /// Drop grace keys past their deadline
    pub async fn prune_grace_keys(&self) -> usize {
        let now = self.clock.now_ms();
        let mut grace = self.grace.write().await;
        let before = grace.len();
        grace.retain(|k| k.expires_at_ms >= now);
        let pruned = before - grace.len();
        if pruned > 0 {
            tracing::info!(pruned, "Pruned expired Shamir grace keys");
        }
        pruned
    }

    pub async fn key_info(&self) -> KeyInfo {
        self.prune_grace_keys().await;
        let current = self.current.read().await;
        let grace = self.grace.read().await;
        KeyInfo {
            current_key_id: current.as_ref().map(|m| m.key_id.clone()),
            p_b64u: self.shamir.p_b64u(),
            grace_key_ids: grace.iter().map(|k| k.key_id.clone()).collect(),
            apply_lock_enabled: current.as_ref().is_some_and(|m| m.e_s.is_some()),
            remove_lock_enabled: current.as_ref().is_some_and(|m| m.d_s.is_some()),
        }
    }
}
