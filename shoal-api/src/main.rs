//! Shoal API server
//!
//! Loads configuration, opens the registry database and serves the control
//! plane until SIGTERM or SIGINT.

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use shoal_api::{api, config, db, logging, shutdown, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "--sample-config") {
        println!("{}", config::ShoalConfig::generate_sample());
        return Ok(());
    }

    // Load configuration
    let shoal_config = config::ShoalConfig::load();

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = logging::init(&shoal_config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if let Err(e) = shoal_config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }
    info!("Configuration loaded successfully");

    // Initialize database
    let database = Arc::new(
        db::Database::new(
            &shoal_config.database.url,
            shoal_config.database.max_connections,
        )
        .await?,
    );
    database.migrate().await?;
    info!("Database initialized at {}", shoal_config.database.url);

    let addr = format!("{}:{}", shoal_config.server.host, shoal_config.server.port);
    let state = Arc::new(AppState::from_config(shoal_config, database.clone())?);
    let app = api::router(state);

    let coordinator = shutdown::ShutdownCoordinator::new();
    let signal_watcher = coordinator.clone();
    tokio::spawn(async move { signal_watcher.wait_for_signal().await });

    let listener = TcpListener::bind(&addr).await?;
    info!("Shoal API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { coordinator.wait().await })
        .await?;

    info!("Server stopped, closing database...");
    database.close().await;
    info!("Shutdown complete");

    Ok(())
}
