//! Cross-process broadcast bus.
//!
//! A one-way event bus: every relay process publishes the broadcasts it
//! originates and delivers the envelopes published by the others to its own
//! local members. Membership is never shared through it.

mod memory;
mod redis_pubsub;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub use memory::MemoryBackplane;
pub use redis_pubsub::RedisBackplane;

use crate::protocol::ServerEvent;
use crate::types::*;

pub type BackplaneResult<T> = Result<T, BackplaneError>;

#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    #[error("backplane unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish queue full, envelope dropped")]
    QueueFull,

    #[error("backplane closed")]
    Closed,
}

/// Everything a subscribing process needs to replay a broadcast locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackplaneEnvelope {
    pub origin: ProcessId,
    pub channel_id: ChannelId,
    pub event: String,
    pub data: Value,
    pub exclude: Option<ConnectionId>,
}

impl BackplaneEnvelope {
    pub fn new(
        origin: &str,
        channel_id: &str,
        event: &ServerEvent,
        exclude: Option<&str>,
    ) -> Self {
        Self {
            origin: origin.to_string(),
            channel_id: channel_id.to_string(),
            event: event.event.clone(),
            data: event.data.clone(),
            exclude: exclude.map(str::to_string),
        }
    }

    pub fn server_event(&self) -> ServerEvent {
        ServerEvent::new(self.event.clone(), self.data.clone())
    }
}

#[async_trait]
pub trait Backplane: Send + Sync {
    /// Hand an envelope to the bus. Must not wait on remote I/O for long
    async fn publish(&self, envelope: BackplaneEnvelope) -> BackplaneResult<()>;

    /// Stream of envelopes published by any process, this one included
    async fn subscribe(&self) -> BackplaneResult<mpsc::Receiver<BackplaneEnvelope>>;

    fn name(&self) -> &str;
}
