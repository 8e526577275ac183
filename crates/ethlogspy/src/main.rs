//! EthLogSpy server binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ethlogspy::{proxy, Config, Services};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ethlogspy", about = "Caching reverse proxy for the Ethereum JSON-RPC interface")]
struct Args {
    /// Path to the configuration directory.
    #[arg(long, default_value = "/usr/local/ethlogspy/configs/")]
    config: PathBuf,
    /// Activate intel mode (enhanced logging).
    #[arg(long)]
    intel: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_filter = if args.intel { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!("retrieving configuration");
    let config = Config::load(&args.config).context("failed to load configuration")?;
    tracing::info!("configuration retrieved successfully");

    let services = Services::init(config)
        .await
        .context("failed to initialize services")?;

    let synchroniser = Arc::new(services.synchroniser());
    if let Err(e) = synchroniser.backfill_if_empty().await {
        tracing::error!(reason = %e, "startup backfill failed, continuing with live sync");
    }
    let follower = tokio::spawn(Arc::clone(&synchroniser).run());

    let state = proxy::ProxyState::new(Arc::clone(&services))?;
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    let result = proxy::serve(state, shutdown).await;

    // Shutdown order: stop the head subscription, then close the store.
    follower.abort();
    services.shutdown().await;
    result
}
