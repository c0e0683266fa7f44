//! Cloudpool development server.
//!
//! Serves the pool API over an in-memory driver, so the full engine can be
//! exercised without cloud credentials. Build with `--features dev-mode`.
//!
//! # Restore
//!
//! On startup the most recently applied configuration is restored from
//! `DATA_DIR`. With `POOL_AUTOSTART` (default `true`) a restored pool is
//! started right away.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloudpool_api::{create_router, ApiConfig, ApiState};
use cloudpool_engine::{BaseCloudPool, CloudPool, MockDriver};
use cloudpool_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cloudpool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting cloudpool server");

    let config = ApiConfig::from_env();
    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        autostart = config.autostart,
        "Server configuration loaded"
    );

    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&config.data_dir)?);

    tracing::warn!("DEV MODE - machines are simulated in memory");
    let driver = Arc::new(MockDriver::new());
    let pool = Arc::new(BaseCloudPool::with_log_alerts(driver, store));

    if pool.restore().await? && config.autostart {
        pool.start().await?;
    }

    let listen_addr = config.listen_addr.clone();
    let app = create_router(ApiState::new(Arc::clone(&pool), config));

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Cloudpool server shutting down");
    pool.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received terminate signal, shutting down"),
    }
}
