//! Connection lifecycle and the authentication gate.
//!
//! Every live socket gets an entry here before authentication; the entry
//! owns the connection's outbound queue and, once admitted, its Session.

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

use crate::credentials::{CredentialError, CredentialValidator};
use crate::protocol::ServerEvent;
use crate::types::*;

/// Sending half of a connection's outbound queue
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication rejected: {0}")]
    Rejected(String),

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is already authenticated")]
    AlreadyAuthenticated(ConnectionId),
}

impl From<CredentialError> for AuthError {
    fn from(err: CredentialError) -> Self {
        if err.is_store_fault() {
            AuthError::StoreUnavailable(err.to_string())
        } else {
            AuthError::Rejected(err.to_string())
        }
    }
}

/// A channel member: a connection plus where to deliver its events
#[derive(Debug, Clone)]
pub struct Member {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub sender: EventSender,
}

/// Handed to the transport once a connection is admitted
#[derive(Debug)]
pub struct LiveConnection {
    pub session: Session,
    pub events: EventReceiver,
}

#[derive(Debug)]
struct ConnectionEntry {
    state: ConnectionState,
    session: Option<Session>,
    sender: EventSender,
}

pub struct SessionRegistry {
    validator: CredentialValidator,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl SessionRegistry {
    pub fn new(validator: CredentialValidator) -> Self {
        Self {
            validator,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Record a new transport connection in the `Connecting` state
    pub async fn register(&self) -> (ConnectionId, EventReceiver) {
        let connection_id = new_id();
        let (sender, receiver) = mpsc::unbounded_channel();

        self.connections.write().await.insert(
            connection_id.clone(),
            ConnectionEntry {
                state: ConnectionState::Connecting,
                session: None,
                sender,
            },
        );

        tracing::debug!(%connection_id, "Connection registered");
        (connection_id, receiver)
    }

    /// Validate `token` and bind the resulting Session to the connection.
    ///
    /// A rejected connection is dropped from the registry; the transport is
    /// expected to close it.
    pub async fn authenticate(
        &self,
        connection_id: &ConnectionId,
        token: Option<&str>,
    ) -> Result<Session, AuthError> {
        match self.state(connection_id).await {
            None => return Err(AuthError::UnknownConnection(connection_id.clone())),
            Some(ConnectionState::Authenticated) => {
                return Err(AuthError::AlreadyAuthenticated(connection_id.clone()))
            }
            Some(_) => {}
        }

        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let Some(token) = token else {
            tracing::warn!(%connection_id, "No token provided");
            self.close(connection_id).await;
            return Err(AuthError::Rejected("missing token".to_string()));
        };

        // The store round-trip runs without holding the registry lock
        let claims = match self.validator.validate(token).await {
            Ok(claims) => claims,
            Err(e) => {
                self.close(connection_id).await;
                return Err(e.into());
            }
        };

        let mut connections = self.connections.write().await;
        let entry = connections
            .get_mut(connection_id)
            .ok_or_else(|| AuthError::UnknownConnection(connection_id.clone()))?;
        if entry.session.is_some() {
            return Err(AuthError::AlreadyAuthenticated(connection_id.clone()));
        }

        let session = Session::new(connection_id.clone(), claims);
        entry.session = Some(session.clone());
        entry.state = ConnectionState::Authenticated;

        tracing::info!(%connection_id, user_id = %session.user_id, "Client connected");
        Ok(session)
    }

    pub async fn state(&self, connection_id: &str) -> Option<ConnectionState> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|entry| entry.state)
    }

    pub async fn session(&self, connection_id: &str) -> Option<Session> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .and_then(|entry| entry.session.clone())
    }

    /// Membership record for an authenticated connection
    pub async fn member(&self, connection_id: &str) -> Option<Member> {
        let connections = self.connections.read().await;
        let entry = connections.get(connection_id)?;
        let session = entry.session.as_ref()?;
        Some(Member {
            connection_id: session.connection_id.clone(),
            user_id: session.user_id.clone(),
            sender: entry.sender.clone(),
        })
    }

    /// Release the connection and its Session. Returns the Session, if any
    pub async fn close(&self, connection_id: &str) -> Option<Session> {
        let mut entry = self.connections.write().await.remove(connection_id)?;
        entry.state = ConnectionState::Closed;
        tracing::debug!(%connection_id, "Connection closed");
        entry.session
    }

    /// Number of authenticated connections
    pub async fn connection_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| entry.state == ConnectionState::Authenticated)
            .count()
    }
}
