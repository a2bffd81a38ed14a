//! Relay configuration, read from environment variables

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_AUTH_TOKEN_PREFIX: &str = "tc2:socket:auth";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_BACKPLANE_CHANNEL: &str = "aeolus:broadcast";
const DEFAULT_CREDENTIAL_TIMEOUT_MS: u64 = 2000;
const DEFAULT_TYPING_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub port: u16,
    /// `*` for any origin, otherwise one allowed origin
    pub cors_origin: String,
    pub auth_token_prefix: String,
    /// Bearer secret for the webhook endpoints (None = webhooks unavailable)
    pub server_secret: Option<String>,
    /// Credential store
    pub redis_url: String,
    /// Pub/Sub backplane (None = single-process mode)
    pub backplane_url: Option<String>,
    pub backplane_channel: String,
    pub credential_timeout: Duration,
    /// Idle time after which a typing indicator is cleared (None = never)
    pub typing_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            cors_origin: "*".to_string(),
            auth_token_prefix: DEFAULT_AUTH_TOKEN_PREFIX.to_string(),
            server_secret: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            backplane_url: None,
            backplane_channel: DEFAULT_BACKPLANE_CHANNEL.to_string(),
            credential_timeout: Duration::from_millis(DEFAULT_CREDENTIAL_TIMEOUT_MS),
            typing_timeout: Some(Duration::from_secs(DEFAULT_TYPING_TIMEOUT_SECS)),
        }
    }
}

impl RelayConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let config = Self::from_vars(|key| std::env::var(key).ok());

        tracing::info!(
            port = config.port,
            cors_origin = %config.cors_origin,
            auth_token_prefix = %config.auth_token_prefix,
            webhooks = config.server_secret.is_some(),
            backplane = config.backplane_url.is_some(),
            "Relay config loaded"
        );
        if config.server_secret.is_none() {
            tracing::warn!("SERVER_SECRET not set - webhook endpoints will answer 503");
        }
        if config.backplane_url.is_none() {
            tracing::warn!(
                "BACKPLANE_REDIS_URL not set - broadcasts will not reach other relay processes"
            );
        }

        config
    }

    /// Build a config from any variable lookup; unset or empty values use defaults
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let typing_timeout = match parse_or(
            var("TYPING_TIMEOUT_SECS"),
            "TYPING_TIMEOUT_SECS",
            DEFAULT_TYPING_TIMEOUT_SECS,
        ) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Self {
            port: parse_or(var("PORT"), "PORT", defaults.port),
            cors_origin: var("CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            auth_token_prefix: var("AUTH_TOKEN_PREFIX").unwrap_or(defaults.auth_token_prefix),
            server_secret: var("SERVER_SECRET"),
            redis_url: var("REDIS_URL").unwrap_or(defaults.redis_url),
            backplane_url: var("BACKPLANE_REDIS_URL"),
            backplane_channel: var("BACKPLANE_CHANNEL").unwrap_or(defaults.backplane_channel),
            credential_timeout: Duration::from_millis(parse_or(
                var("CREDENTIAL_TIMEOUT_MS"),
                "CREDENTIAL_TIMEOUT_MS",
                DEFAULT_CREDENTIAL_TIMEOUT_MS,
            )),
            typing_timeout,
        }
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, %default, "Invalid value, using default");
            default
        }),
        None => default,
    }
}
