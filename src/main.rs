use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aeolus::{
    backplane::{Backplane, RedisBackplane},
    broadcast,
    config::RelayConfig,
    credentials::RedisCredentialStore,
    state::AppState,
    typing,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aeolus=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting aeolus relay...");

    let config = RelayConfig::from_env();
    let shutdown = CancellationToken::new();

    let store = match RedisCredentialStore::connect(&config.redis_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to credential store");
            std::process::exit(1);
        }
    };

    let backplane: Option<Arc<dyn Backplane>> = match &config.backplane_url {
        Some(url) => {
            match RedisBackplane::start(url, config.backplane_channel.clone(), shutdown.clone()) {
                Ok(backplane) => Some(Arc::new(backplane)),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start backplane");
                    std::process::exit(1);
                }
            }
        }
        None => None,
    };

    let port = config.port;
    let state = Arc::new(AppState::with_shutdown(
        config,
        Arc::new(store),
        backplane,
        shutdown.clone(),
    ));
    tracing::info!(process_id = %state.process_id, "Relay state initialized");

    // Replay broadcasts from other relay processes to local members
    broadcast::spawn_backplane_listener(state.clone()).await;

    // Clear typing indicators of clients that went quiet
    typing::spawn_typing_sweeper(state.clone());

    let app = aeolus::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!("Listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown));
    if let Err(e) = server.await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
    tracing::info!("Relay stopped");
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down, closing sockets");
    shutdown.cancel();
}
