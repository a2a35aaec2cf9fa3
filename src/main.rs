//! VRF Relay CLI
//!
//! Runs the escrow and threshold store relay, or generates Shamir server keys.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use vrf_authority::clock;
use vrf_authority::config::{ConfigError, RelayConfig};
use vrf_authority::escrow::{derive_key_id, Shamir3Pass, ShamirEscrowService, ShamirKeystore};
use vrf_authority::logging::{init_from_config, init_logging, LogLevel};
use vrf_authority::threshold::{MemoryThresholdStore, SqliteThresholdStore, ThresholdStore};
use vrf_authority::{create_router, AppState};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "vrf-relay")]
#[command(about = "Shamir 3-pass escrow and threshold authorization relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Run {
        /// TOML config file; environment variables override it
        #[arg(short, long)]
        config: Option<String>,

        /// Bind address (e.g., 0.0.0.0:9090)
        #[arg(short, long)]
        bind: Option<String>,

        /// Path to encrypted Shamir key file
        #[arg(short, long)]
        key_file: Option<String>,

        /// Key file password (or set VRF_RELAY_KEY_PASSWORD env var)
        #[arg(short, long, env = "VRF_RELAY_KEY_PASSWORD")]
        password: Option<String>,
    },

    /// Generate a Shamir server exponent pair into an encrypted key file
    GenerateKeys {
        /// Output key file
        #[arg(short, long, default_value = "config/shamir.key.enc")]
        output: String,

        /// Key id; derived from e_s when omitted
        #[arg(short = 'i', long)]
        key_id: Option<String>,

        /// Custom prime modulus (base64url); RFC 3526 MODP-2048 when omitted
        #[arg(long, env = "VRF_RELAY_SHAMIR_P_B64U")]
        p_b64u: Option<String>,

        /// Key file password
        #[arg(short, long, env = "VRF_RELAY_KEY_PASSWORD")]
        password: String,
    },
}

#[tokio::main]
async fn main() -> vrf_authority::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            bind,
            key_file,
            password,
        } => {
            run_server(config, bind, key_file, password).await?;
        }
        Commands::GenerateKeys {
            output,
            key_id,
            p_b64u,
            password,
        } => {
            generate_keys(output, key_id, p_b64u, password)?;
        }
    }

    Ok(())
}

/// Run the relay server
async fn run_server(
    config_path: Option<String>,
    bind: Option<String>,
    key_file: Option<String>,
    password: Option<String>,
) -> vrf_authority::Result<()> {
    let mut config = match config_path {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::from_env()?,
    };
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Some(key_file) = key_file {
        config.shamir.key_file = Some(key_file);
    }
    config.validate()?;

    init_from_config(&config)?;
    config.print_summary();

    let clock = clock::system();

    let keystore_keys = match config.shamir.key_file.clone() {
        Some(path) => {
            let keystore = ShamirKeystore::new(&path);
            if !keystore.exists() {
                tracing::warn!(path = %path, "Shamir key file not found. Run generate-keys to create one.");
                None
            } else if let Some(password) = password.as_deref() {
                if config.shamir.p_b64u.is_none() {
                    config.shamir.p_b64u = Some(keystore.modulus_b64u()?);
                }
                Some(keystore.load(password)?)
            } else {
                tracing::warn!("No key file password given; Shamir key file not loaded");
                None
            }
        }
        None => None,
    };

    let escrow = Arc::new(ShamirEscrowService::from_config(
        &config.shamir,
        keystore_keys,
        clock.clone(),
    )?);

    let participants = config.threshold.participants();
    let threshold: Arc<dyn ThresholdStore> = match &config.threshold.db_path {
        Some(path) => {
            tracing::info!(path = %path, "Using SQLite threshold store");
            Arc::new(SqliteThresholdStore::new(path, participants, clock.clone())?)
        }
        None => {
            tracing::info!("Using in-memory threshold store");
            Arc::new(MemoryThresholdStore::new(participants, clock.clone()))
        }
    };

    spawn_maintenance(escrow.clone(), threshold.clone());

    let state = Arc::new(
        AppState::new(escrow, threshold).with_allowed_origins(config.allowed_origins.clone()),
    );
    let app = create_router(state);
    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            ConfigError::InvalidValue("VRF_RELAY_BIND".to_string(), e.to_string())
        })?;

    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Periodically drop expired store entries and grace keys
fn spawn_maintenance(escrow: Arc<ShamirEscrowService>, threshold: Arc<dyn ThresholdStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match threshold.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "Purged expired threshold entries"),
                Err(e) => tracing::warn!(error = %e, "Threshold purge failed"),
            }
            escrow.prune_grace_keys().await;
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Generate a fresh exponent pair and save it encrypted
fn generate_keys(
    output: String,
    key_id: Option<String>,
    p_b64u: Option<String>,
    password: String,
) -> vrf_authority::Result<()> {
    init_logging(LogLevel::Info, false)?;

    let shamir = match p_b64u {
        Some(p) => Shamir3Pass::from_b64u(&p)?,
        None => Shamir3Pass::default(),
    };
    let keypair = ShamirEscrowService::disabled(shamir.clone(), clock::system())
        .generate_server_keypair()?;
    let key_id = key_id.unwrap_or_else(|| derive_key_id(&keypair.e_s));

    ShamirKeystore::new(&output).save(&key_id, &keypair, &shamir.p_b64u(), &password)?;

    tracing::info!(key_id = %key_id, path = %output, "Generated Shamir server key");
    println!("key id: {}", key_id);
    Ok(())
}
