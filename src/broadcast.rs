use crate::backplane::{Backplane, BackplaneEnvelope};
use crate::channel::ChannelTable;
use crate::protocol::ServerEvent;
use crate::state::AppState;
use crate::types::*;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Fan-out of events to channel members, locally and across processes
pub struct Broadcaster {
    channels: Arc<ChannelTable>,
    backplane: Option<Arc<dyn Backplane>>,
    process_id: ProcessId,
}

impl Broadcaster {
    pub fn new(
        channels: Arc<ChannelTable>,
        backplane: Option<Arc<dyn Backplane>>,
        process_id: ProcessId,
    ) -> Self {
        Self {
            channels,
            backplane,
            process_id,
        }
    }

    pub fn backplane(&self) -> Option<&Arc<dyn Backplane>> {
        self.backplane.as_ref()
    }

    /// Deliver `event` to every member of `channel_id` except `exclude`.
    ///
    /// Local members are served before this returns; the event is then handed
    /// to the backplane for the other processes. Returns the local delivery
    /// count. Never fails: delivery and publish errors are logged only.
    pub async fn broadcast(
        &self,
        channel_id: &str,
        event: ServerEvent,
        exclude: Option<&str>,
    ) -> usize {
        let delivered = self.deliver_local(channel_id, &event, exclude).await;

        if let Some(backplane) = &self.backplane {
            let envelope = BackplaneEnvelope::new(&self.process_id, channel_id, &event, exclude);
            if let Err(e) = backplane.publish(envelope).await {
                tracing::warn!(
                    %channel_id,
                    event = %event.event,
                    backplane = backplane.name(),
                    error = %e,
                    "Failed to publish broadcast to backplane"
                );
            }
        }

        delivered
    }

    /// Deliver to this process's own members of the channel.
    ///
    /// A member whose queue is gone is pruned from the channel.
    pub async fn deliver_local(
        &self,
        channel_id: &str,
        event: &ServerEvent,
        exclude: Option<&str>,
    ) -> usize {
        let members = self.channels.members_of(channel_id).await;
        let mut delivered = 0;
        let mut stale = Vec::new();

        for member in members {
            if exclude == Some(member.connection_id.as_str()) {
                continue;
            }
            match member.sender.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(
                        %channel_id,
                        connection_id = %member.connection_id,
                        event = %event.event,
                        "Delivery failed, pruning stale member"
                    );
                    stale.push(member.connection_id);
                }
            }
        }

        for connection_id in stale {
            self.channels.leave(channel_id, &connection_id).await;
        }

        tracing::debug!(%channel_id, event = %event.event, delivered, "Broadcast delivered");
        delivered
    }

    /// Replay an envelope from the backplane. Own envelopes were already
    /// delivered locally and are skipped (`None`)
    pub async fn receive(&self, envelope: BackplaneEnvelope) -> Option<usize> {
        if envelope.origin == self.process_id {
            return None;
        }
        let event = envelope.server_event();
        Some(
            self.deliver_local(&envelope.channel_id, &event, envelope.exclude.as_deref())
                .await,
        )
    }
}

/// Spawn the task that replays other processes' broadcasts to local members.
///
/// Returns `None` in single-process mode or when subscribing fails.
pub async fn spawn_backplane_listener(state: Arc<AppState>) -> Option<JoinHandle<()>> {
    let backplane = state.broadcaster.backplane()?.clone();

    let mut rx = match backplane.subscribe().await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(backplane = backplane.name(), error = %e, "Failed to subscribe to backplane");
            return None;
        }
    };

    tracing::info!(backplane = backplane.name(), process_id = %state.process_id, "Backplane listener started");

    Some(tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            state.broadcaster.receive(envelope).await;
        }
        tracing::info!("Backplane listener stopped");
    }))
}
