//! Process-local channel membership.
//!
//! Both indexes live behind one lock so a broadcast snapshot always sees a
//! membership set from before or after a mutation, never in between.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::session::Member;
use crate::types::*;

/// Result of `init`/`join`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// The channel record did not exist before this call
    pub created: bool,
    /// The connection was not already a member
    pub added: bool,
}

#[derive(Default)]
struct Tables {
    channels: HashMap<ChannelId, HashMap<ConnectionId, Member>>,
    memberships: HashMap<ConnectionId, HashSet<ChannelId>>,
}

impl Tables {
    fn insert(&mut self, channel_id: &str, member: Member) -> Admission {
        let created = !self.channels.contains_key(channel_id);
        let members = self.channels.entry(channel_id.to_string()).or_default();
        let connection_id = member.connection_id.clone();
        let added = members.insert(connection_id.clone(), member).is_none();

        self.memberships
            .entry(connection_id)
            .or_default()
            .insert(channel_id.to_string());

        Admission { created, added }
    }

    fn remove(&mut self, channel_id: &str, connection_id: &str) -> Option<Member> {
        let members = self.channels.get_mut(channel_id)?;
        let removed = members.remove(connection_id)?;

        if members.is_empty() {
            self.channels.remove(channel_id);
            tracing::debug!(%channel_id, "Channel has no more members, removed");
        }

        if let Some(joined) = self.memberships.get_mut(connection_id) {
            joined.remove(channel_id);
            if joined.is_empty() {
                self.memberships.remove(connection_id);
            }
        }

        Some(removed)
    }
}

#[derive(Default)]
pub struct ChannelTable {
    tables: RwLock<Tables>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure the channel exists and `member` belongs to it. Idempotent
    pub async fn init(&self, channel_id: &str, member: Member) -> Admission {
        let admission = self.tables.write().await.insert(channel_id, member);
        if admission.created {
            tracing::info!(%channel_id, "Channel initialized");
        }
        admission
    }

    /// Add `member` to the channel, creating the channel when needed
    pub async fn join(&self, channel_id: &str, member: Member) -> Admission {
        let connection_id = member.connection_id.clone();
        let user_id = member.user_id.clone();
        let admission = self.tables.write().await.insert(channel_id, member);
        tracing::info!(
            %channel_id,
            %connection_id,
            %user_id,
            created = admission.created,
            "Joined channel"
        );
        admission
    }

    /// Remove the connection from the channel. `None` when it was not a member
    pub async fn leave(&self, channel_id: &str, connection_id: &str) -> Option<Member> {
        let removed = self.tables.write().await.remove(channel_id, connection_id);
        if let Some(member) = &removed {
            tracing::info!(%channel_id, %connection_id, user_id = %member.user_id, "Left channel");
        }
        removed
    }

    /// Remove the connection from every channel it belonged to, atomically.
    ///
    /// Returns the channels it was removed from, with its member record.
    pub async fn remove_connection(&self, connection_id: &str) -> Vec<(ChannelId, Member)> {
        let mut tables = self.tables.write().await;
        let Some(joined) = tables.memberships.get(connection_id).cloned() else {
            return Vec::new();
        };

        joined
            .into_iter()
            .filter_map(|channel_id| {
                tables
                    .remove(&channel_id, connection_id)
                    .map(|member| (channel_id, member))
            })
            .collect()
    }

    /// Snapshot of the channel's current members
    pub async fn members_of(&self, channel_id: &str) -> Vec<Member> {
        self.tables
            .read()
            .await
            .channels
            .get(channel_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, channel_id: &str, connection_id: &str) -> bool {
        self.tables
            .read()
            .await
            .channels
            .get(channel_id)
            .is_some_and(|members| members.contains_key(connection_id))
    }

    /// Whether any connection of `user_id` is still in the channel
    pub async fn has_user(&self, channel_id: &str, user_id: &str) -> bool {
        self.tables
            .read()
            .await
            .channels
            .get(channel_id)
            .is_some_and(|members| members.values().any(|m| m.user_id == user_id))
    }

    pub async fn channels_of(&self, connection_id: &str) -> Vec<ChannelId> {
        self.tables
            .read()
            .await
            .memberships
            .get(connection_id)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn member_count(&self, channel_id: &str) -> usize {
        self.tables
            .read()
            .await
            .channels
            .get(channel_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub async fn channel_count(&self) -> usize {
        self.tables.read().await.channels.len()
    }
}
