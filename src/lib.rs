//! Passkey-gated VRF sessions with relay-assisted key escrow
//!
//! This library unlocks a VRF keypair on successful biometric
//! authentication, mints short-lived warm signing sessions from it, and lets
//! a relay help recover the keypair without ever learning it.
//!
//! # Architecture
//!
//! - `channel`: correlated request/response messaging with the isolated worker
//! - `worker`: the VRF worker actor that owns all key material
//! - `lifecycle`: login, registration, and signing session state machine
//! - `escrow`: Shamir three-pass commutative locks over a safe prime
//! - `threshold`: consume-once authorization store for two-party signing
//! - `server`: the relay HTTP surface over `escrow` and `threshold`
//!
//! # Usage
//!
//! ## Generate relay exponents
//! ```bash
//! vrf-relay generate-keys --output config/shamir.key.enc
//! ```
//!
//! ## Start the relay
//! ```bash
//! vrf-relay run --config config/relay.toml
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod escrow;
pub mod lifecycle;
pub mod logging;
pub mod server;
pub mod threshold;
pub mod types;
pub mod worker;

pub use channel::{AbortController, AbortSignal, ChannelError, SendOptions, WorkerChannel};
pub use config::RelayConfig;
pub use error::{AuthorityError, ErrorKind, Result};
pub use escrow::{ShamirEscrowService, ShamirKeystore};
pub use lifecycle::{CredentialOrchestrator, OrchestratorConfig, OrchestratorError};
pub use server::{create_router, AppState};
pub use threshold::{MemoryThresholdStore, SqliteThresholdStore, ThresholdStore};
pub use worker::{spawn_vrf_worker, WorkerConfig};
pub use types::*;
