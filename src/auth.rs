//! Shared-secret bearer authentication for the webhook endpoints

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::api::WebhookError;

/// Secret the host application presents as `Authorization: Bearer {secret}`
#[derive(Debug, Clone)]
pub struct WebhookAuth {
    /// None = webhooks unavailable
    pub secret: Option<String>,
}

impl WebhookAuth {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    /// Check an `Authorization` header value
    pub fn check(&self, authorization: Option<&str>) -> Result<(), WebhookError> {
        let Some(secret) = &self.secret else {
            tracing::error!("SERVER_SECRET not configured");
            return Err(WebhookError::SecretNotConfigured);
        };

        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(WebhookError::Unauthorized)?;

        // Use constant-time comparison to prevent timing attacks
        if constant_time_eq(secret.as_bytes(), token.as_bytes()) {
            Ok(())
        } else {
            Err(WebhookError::Unauthorized)
        }
    }
}

/// Constant-time byte comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Middleware rejecting webhook calls before any channel logic runs
pub async fn webhook_auth_middleware(
    State(auth): State<Arc<WebhookAuth>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match auth.check(authorization) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::warn!(uri = %request.uri(), error = %e, "Rejected webhook call");
            e.into_response()
        }
    }
}
