use crate::backplane::Backplane;
use crate::broadcast::Broadcaster;
use crate::channel::ChannelTable;
use crate::config::RelayConfig;
use crate::credentials::{CredentialStore, CredentialValidator};
use crate::session::{AuthError, LiveConnection, SessionRegistry};
use crate::typing::TypingTracker;
use crate::types::*;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Process-local relay state, shared by every socket and HTTP handler.
///
/// Nothing here is shared with other relay processes; they only see what
/// goes over the backplane.
pub struct AppState {
    pub config: RelayConfig,
    pub process_id: ProcessId,
    pub sessions: SessionRegistry,
    pub channels: Arc<ChannelTable>,
    pub typing: TypingTracker,
    pub broadcaster: Broadcaster,
    pub started_at: Instant,
    /// Cancelled on shutdown; stops background tasks
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn CredentialStore>,
        backplane: Option<Arc<dyn Backplane>>,
    ) -> Self {
        Self::with_shutdown(config, store, backplane, CancellationToken::new())
    }

    pub fn with_shutdown(
        config: RelayConfig,
        store: Arc<dyn CredentialStore>,
        backplane: Option<Arc<dyn Backplane>>,
        shutdown: CancellationToken,
    ) -> Self {
        let process_id = new_id();
        let validator = CredentialValidator::new(
            store,
            config.auth_token_prefix.clone(),
            config.credential_timeout,
        );
        let channels = Arc::new(ChannelTable::new());

        Self {
            process_id: process_id.clone(),
            sessions: SessionRegistry::new(validator),
            broadcaster: Broadcaster::new(channels.clone(), backplane, process_id),
            channels,
            typing: TypingTracker::new(),
            started_at: Instant::now(),
            shutdown,
            config,
        }
    }

    /// Register a new connection and run it through the authentication gate.
    ///
    /// On rejection nothing about the connection remains in the relay.
    pub async fn open_connection(&self, token: Option<&str>) -> Result<LiveConnection, AuthError> {
        let (connection_id, events) = self.sessions.register().await;
        let session = self.sessions.authenticate(&connection_id, token).await?;
        Ok(LiveConnection { session, events })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
