use std::error::Error;

use session_sync::core::collab::{CollabState, session_router};
use session_sync::core::config::Config;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load .env file (if exists)
    let _ = dotenvy::dotenv();

    // Initialize tracing, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config =
        Config::from_env().inspect_err(|e| tracing::error!("Invalid configuration: {}", e))?;

    tracing::info!(
        max_sessions = config.max_sessions,
        allowed_origins = ?config.allowed_origins,
        "Config loaded"
    );

    let state = CollabState::from_config(&config);
    let app = session_router(state).layer(TraceLayer::new_for_http());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("listening on http://{}", addr);
    tracing::info!("Session REST API: http://{}/sessions", addr);
    tracing::info!("Push channel: ws://{}/ws?sessionId={{id}}&userId={{user}}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}
