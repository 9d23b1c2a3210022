use sipdialer::config::Config;
use sipdialer::domain::number_registry::InMemoryNumberRegistry;
use sipdialer::interface::api::{build_router, AppState};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting sipdialer {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    info!("Configuration loaded: {:?}", config);

    let bind_addr = config.server.bind_addr();
    let state = AppState::new(config, Arc::new(InMemoryNumberRegistry::new()));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Control API listening on http://{} (WebSocket at /ws)", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("sipdialer stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
