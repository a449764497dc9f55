mod api;
mod config;
mod lb;
mod maintenance;

use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("origin_proxyd=info"))
        )
        .init();

    tracing::info!("Starting origin-proxyd {}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/origin-proxy/proxy.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Build and initialize the load balancer
    let balancer = lb::build(&config);
    balancer
        .initialize(&cancel)
        .await
        .with_context(|| format!("Failed to initialize {:?} load balancer", config.balancer.kind))?;

    // Spawn maintenance task
    let maintenance_handle = tokio::spawn(maintenance::run(
        balancer.clone(),
        config.balancer.maintenance_interval_secs,
        cancel.clone(),
    ));

    // Build API router
    let app_state = api::routes::AppState {
        lb: balancer.clone(),
        cancel: cancel.clone(),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("System API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(maintenance_handle, server_handle);

    tracing::info!("Shutdown complete");
    Ok(())
}
