//! appscaler controller
//!
//! Keeps every workload targeted by an AppScaler at the AppScaler's replica
//! count, correcting drift as it appears.

use std::sync::Arc;

use anyhow::{Context, Result};
use appscaler_controller::{
    config::Config,
    controller::{Controller, ControllerConfig},
    store::MemoryStore,
};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to APPSCALER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting appscaler controller");
    info!(
        workers = config.workers,
        state_file = ?config.state_file,
        "Configuration loaded"
    );

    let store = match &config.state_file {
        Some(path) => MemoryStore::load_seed(path)
            .await
            .with_context(|| format!("failed to seed store from {}", path.display()))?,
        None => {
            warn!("No APPSCALER_STATE_FILE set, starting with an empty store");
            MemoryStore::new()
        }
    };
    let store = Arc::new(store);

    let shutdown_timeout = config.shutdown_timeout;
    let controller = Controller::new(
        store,
        ControllerConfig::from(config),
        info_span!("appscaler"),
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller_handle = tokio::spawn(async move {
        controller.run(shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C)
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for controller to shut down...");
    match tokio::time::timeout(shutdown_timeout, controller_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Controller task panicked"),
        Err(_) => warn!("Controller did not shut down in time"),
    }

    info!("appscaler controller shutdown complete");
    Ok(())
}
