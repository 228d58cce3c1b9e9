//! skyway daemon
//!
//! Runs the service supervisor, which keeps the billing worker, the
//! association sync and one node controller per cloud account alive.

use anyhow::Result;
use skyway_control_plane::{config, state::AppState};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to SKYWAY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting skyway daemon");
    info!(db_path = %config.db_path.display(), "Configuration loaded");

    let state = match AppState::build(config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to initialize");
            return Err(e);
        }
    };

    let health = state.store.check()?;
    if !health.is_ok() {
        warn!(integrity = %health.integrity, "State store integrity check failed");
    }

    for name in state.register_default_units()? {
        info!(service = %name, "Registered service");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = state.supervisor();
    let supervisor_handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for services to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, supervisor_handle).await.is_err() {
        warn!("Supervisor did not shut down in time");
    }

    info!("skyway daemon shutdown complete");
    Ok(())
}
