//! Credential lookup against the shared key-value store.
//!
//! The host application writes `{prefix}:{token}` -> JSON claims with a TTL.
//! A missing key is indistinguishable from an expired token.

use async_trait::async_trait;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::types::Claims;

pub type CredentialResult<T> = Result<T, CredentialError>;

/// Errors from a credential lookup
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("token not found")]
    NotFound,

    #[error("malformed claims: {0}")]
    Malformed(String),

    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    #[error("credential lookup timed out after {0:?}")]
    Timeout(Duration),
}

impl CredentialError {
    /// Infrastructure faults, as opposed to a bad credential
    pub fn is_store_fault(&self) -> bool {
        matches!(
            self,
            CredentialError::Unavailable(_) | CredentialError::Timeout(_)
        )
    }
}

/// Read-only access to the shared key-value store
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the raw value stored under `key`, `None` if absent
    async fn get(&self, key: &str) -> CredentialResult<Option<String>>;

    fn name(&self) -> &str;
}

/// Redis-backed store, the production deployment
pub struct RedisCredentialStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisCredentialStore {
    pub async fn connect(redis_url: &str) -> CredentialResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CredentialError::Unavailable(format!("invalid Redis URL: {}", e)))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))?;
        tracing::info!(redis_url, "Credential store connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn get(&self, key: &str) -> CredentialResult<Option<String>> {
        // ConnectionManager is a cheap handle onto one multiplexed connection
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// In-process store for local development and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().await.insert(key.into(), value.into());
    }

    /// Drop a key, as the real store does when a token's TTL runs out
    pub async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> CredentialResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Resolves opaque tokens into claims: one bounded attempt, no retries
#[derive(Clone)]
pub struct CredentialValidator {
    store: Arc<dyn CredentialStore>,
    prefix: String,
    timeout: Duration,
}

impl CredentialValidator {
    pub fn new(store: Arc<dyn CredentialStore>, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            timeout,
        }
    }

    pub fn key_for(&self, token: &str) -> String {
        format!("{}:{}", self.prefix, token)
    }

    pub async fn validate(&self, token: &str) -> CredentialResult<Claims> {
        let key = self.key_for(token);
        let fingerprint = token_fingerprint(token);

        let stored = match tokio::time::timeout(self.timeout, self.store.get(&key)).await {
            Ok(Ok(Some(value))) => value,
            Ok(Ok(None)) => {
                tracing::warn!(token = %fingerprint, "Token not found in credential store");
                return Err(CredentialError::NotFound);
            }
            Ok(Err(e)) => {
                tracing::error!(store = self.store.name(), error = %e, "Credential lookup failed");
                return Err(e);
            }
            Err(_) => {
                tracing::error!(
                    store = self.store.name(),
                    timeout = ?self.timeout,
                    "Credential lookup timed out"
                );
                return Err(CredentialError::Timeout(self.timeout));
            }
        };

        let claims = Claims::parse(&stored).map_err(|reason| {
            tracing::warn!(token = %fingerprint, %reason, "Stored claims are malformed");
            CredentialError::Malformed(reason)
        })?;

        tracing::info!(token = %fingerprint, user_id = %claims.user_id, "Token validated");
        Ok(claims)
    }
}

/// Short, stable token identifier that is safe to log
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl CredentialStore for FailingStore {
        async fn get(&self, _key: &str) -> CredentialResult<Option<String>> {
            Err(CredentialError::Unavailable("connection refused".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct SlowStore;

    #[async_trait]
    impl CredentialStore for SlowStore {
        async fn get(&self, _key: &str) -> CredentialResult<Option<String>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(r#"{"userId": "late"}"#.to_string()))
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn validator(store: Arc<dyn CredentialStore>) -> CredentialValidator {
        CredentialValidator::new(store, "tc2:socket:auth", Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_validate_found_token() {
        let store = MemoryCredentialStore::new();
        store
            .insert("tc2:socket:auth:abc", r#"{"userId": "u1", "sessionId": "s1"}"#)
            .await;

        let claims = validator(Arc::new(store)).validate("abc").await.unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_validate_missing_and_expired_token() {
        let store = MemoryCredentialStore::new();
        store.insert("tc2:socket:auth:abc", r#"{"userId": "u1"}"#).await;
        let validator = validator(Arc::new(store.clone()));

        assert!(matches!(
            validator.validate("other").await,
            Err(CredentialError::NotFound)
        ));

        store.remove("tc2:socket:auth:abc").await;
        assert!(matches!(
            validator.validate("abc").await,
            Err(CredentialError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_validate_malformed_claims() {
        let store = MemoryCredentialStore::new();
        store.insert("tc2:socket:auth:abc", r#"{"role": "x"}"#).await;

        let err = validator(Arc::new(store)).validate("abc").await.unwrap_err();
        assert!(matches!(err, CredentialError::Malformed(_)));
        assert!(!err.is_store_fault());
    }

    #[tokio::test]
    async fn test_store_failure_is_distinct_from_not_found() {
        let err = validator(Arc::new(FailingStore))
            .validate("abc")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Unavailable(_)));
        assert!(err.is_store_fault());
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let err = validator(Arc::new(SlowStore))
            .validate("abc")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Timeout(_)));
        assert!(err.is_store_fault());
    }

    #[test]
    fn test_token_fingerprint_is_stable_and_short() {
        assert_eq!(token_fingerprint("abc"), token_fingerprint("abc"));
        assert_ne!(token_fingerprint("abc"), token_fingerprint("abd"));
        assert_eq!(token_fingerprint("abc").len(), 12);
    }
}
