//! Ephemeral "is typing" state per (channel, user).
//!
//! A stop removes the entry, so an entry only exists after a start.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::ServerEvent;
use crate::state::AppState;
use crate::types::*;

/// How often the sweeper looks for stale indicators
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct TypingState {
    last_update: Instant,
}

#[derive(Default)]
pub struct TypingTracker {
    active: RwLock<HashMap<(ChannelId, UserId), TypingState>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the user as typing. Repeated starts refresh the entry
    pub async fn start(&self, channel_id: &str, user_id: &str) {
        self.active.write().await.insert(
            (channel_id.to_string(), user_id.to_string()),
            TypingState {
                last_update: Instant::now(),
            },
        );
    }

    /// Clear the indicator. Returns whether the user was typing
    pub async fn stop(&self, channel_id: &str, user_id: &str) -> bool {
        self.active
            .write()
            .await
            .remove(&(channel_id.to_string(), user_id.to_string()))
            .is_some()
    }

    pub async fn is_typing(&self, channel_id: &str, user_id: &str) -> bool {
        self.active
            .read()
            .await
            .contains_key(&(channel_id.to_string(), user_id.to_string()))
    }

    pub async fn typing_users(&self, channel_id: &str) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .active
            .read()
            .await
            .keys()
            .filter(|(channel, _)| channel == channel_id)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Remove indicators not refreshed within `timeout`, returning them
    pub async fn expire(&self, timeout: Duration) -> Vec<(ChannelId, UserId)> {
        let now = Instant::now();
        let mut active = self.active.write().await;
        let stale: Vec<(ChannelId, UserId)> = active
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_update) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            active.remove(key);
        }
        stale
    }
}

/// Spawn the sweeper that broadcasts a synthetic stop for indicators whose
/// client went quiet without sending `typing:stop`
pub fn spawn_typing_sweeper(state: Arc<AppState>) -> Option<JoinHandle<()>> {
    let timeout = state.config.typing_timeout?;
    tracing::info!(?timeout, "Typing indicator sweeper started");

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL.min(timeout));
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            for (channel_id, user_id) in state.typing.expire(timeout).await {
                tracing::debug!(%channel_id, %user_id, "Typing indicator expired");
                state
                    .broadcaster
                    .broadcast(&channel_id, ServerEvent::typing(&channel_id, &user_id, false), None)
                    .await;
            }
        }
    }))
}
