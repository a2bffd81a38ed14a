// Public API for integration tests and potential library usage

pub mod api;
pub mod auth;
pub mod backplane;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod protocol;
pub mod session;
pub mod state;
pub mod types;
pub mod typing;
pub mod ws;

use axum::{
    http::HeaderValue,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::WebhookAuth;
use crate::state::AppState;

/// CORS for the configured origin; `*` allows any origin without credentials
fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match HeaderValue::from_str(origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_credentials(true)
            .allow_headers(AllowHeaders::mirror_request())
            .allow_methods(AllowMethods::mirror_request()),
        Err(e) => {
            tracing::warn!(%origin, error = %e, "Invalid CORS_ORIGIN, allowing any origin");
            CorsLayer::permissive()
        }
    }
}

/// Build the relay's HTTP surface: the socket endpoint, health/status, and
/// the secret-protected webhooks.
pub fn build_router(state: Arc<AppState>) -> Router {
    let webhook_auth = Arc::new(WebhookAuth::new(state.config.server_secret.clone()));

    // Protected webhook routes (shared-secret bearer)
    let webhook_routes = Router::new()
        .route("/chat/message", post(api::chat_message))
        .route("/chat/read-receipt", post(api::read_receipt))
        .layer(middleware::from_fn_with_state(
            webhook_auth,
            auth::webhook_auth_middleware,
        ));

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(api::health))
        .route("/status", get(api::status))
        .merge(webhook_routes)
        .layer(cors_layer(&state.config.cors_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
