//! filevault server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use filevault_core::config::AppConfig;
use filevault_server::events::BroadcastEvents;
use filevault_server::registry::InMemorySessionRegistry;
use filevault_server::{AppState, create_router};
use filevault_storage::ChunkStore;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// filevault - resumable chunked file upload server
#[derive(Parser, Debug)]
#[command(name = "filevaultd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "FILEVAULT_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

/// Load configuration from an optional TOML file overlaid with
/// `FILEVAULT_`-prefixed environment variables.
fn load_config(config_path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(config_path).exists() {
        tracing::info!(config_path = %config_path, "Loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::info!(
            config_path = %config_path,
            "No config file found, using defaults and environment"
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("FILEVAULT_").ignore(&["config"]).split("__"))
        .extract()
        .context("failed to load configuration")?;

    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("filevault v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    filevault_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = filevault_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    // Fail fast if the object store is unreachable or misconfigured.
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Object store ready");

    let metadata = filevault_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    // Sessions live in memory, so nothing in scratch survives a restart.
    let chunks = ChunkStore::new(&config.upload.scratch_dir)
        .await
        .context("failed to open scratch directory")?;
    let purged = chunks
        .purge_all()
        .await
        .context("failed to clear scratch directory")?;
    if purged > 0 {
        tracing::warn!(purged, "Removed upload scratch areas left by a previous run");
    }

    let state = AppState::new(
        config.clone(),
        storage,
        metadata,
        chunks,
        Arc::new(InMemorySessionRegistry::new()),
        Arc::new(BroadcastEvents::default()),
    );

    let _sweeper = state.sweeper().spawn(config.upload.sweep_interval());
    tracing::info!(
        ttl_secs = config.upload.session_ttl_secs,
        interval_secs = config.upload.sweep_interval_secs,
        "Session sweeper spawned"
    );

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
