//! Socket event dispatch
//!
//! Each handler applies the membership or typing change and triggers the
//! resulting broadcasts; the returned event, if any, is the direct reply to
//! the sending connection.

use crate::protocol::{ClientEvent, ServerEvent};
use crate::state::AppState;
use crate::types::*;
use serde_json::{json, Value};
use std::sync::Arc;

/// Handle a client event and return an optional reply
pub async fn handle_event(
    event: ClientEvent,
    session: &Session,
    state: &Arc<AppState>,
) -> Option<ServerEvent> {
    if event.channel_id().is_empty() {
        return Some(ServerEvent::error(
            "INVALID_CHANNEL",
            format!("{} requires a channelId", event.name()),
        ));
    }

    tracing::debug!(
        connection_id = %session.connection_id,
        event = event.name(),
        channel_id = event.channel_id(),
        "Client event"
    );

    match event {
        ClientEvent::ChannelInit {
            channel_id,
            metadata,
        } => handle_channel_init(state, session, channel_id, metadata).await,

        ClientEvent::ChannelJoin { channel_id } => {
            handle_channel_join(state, session, channel_id).await
        }

        ClientEvent::ChannelLeave { channel_id } => {
            handle_channel_leave(state, session, channel_id).await
        }

        ClientEvent::MessageSend {
            channel_id,
            data,
            metadata,
        } => {
            tracing::info!(
                %channel_id,
                user_id = %session.user_id,
                "Message from user"
            );
            let message = ServerEvent::message_from_socket(&channel_id, session, data, metadata);
            state
                .broadcaster
                .broadcast(&channel_id, message, Some(&session.connection_id))
                .await;
            None
        }

        ClientEvent::Broadcast {
            channel_id,
            event,
            data,
            exclude_sender,
        } => {
            if event.trim().is_empty() {
                return Some(ServerEvent::error(
                    "INVALID_EVENT",
                    "broadcast requires an event name",
                ));
            }
            let exclude = exclude_sender.then_some(session.connection_id.as_str());
            state
                .broadcaster
                .broadcast(&channel_id, ServerEvent::new(event, data), exclude)
                .await;
            None
        }

        ClientEvent::MessageRead {
            channel_id,
            message_id,
            read_at,
            complete,
            readers,
        } => {
            if is_blank(&message_id) {
                return Some(ServerEvent::error(
                    "INVALID_MESSAGE",
                    "message:read requires a messageId",
                ));
            }
            let complete = is_truthy(&complete);
            let read_at = if is_truthy(&read_at) {
                read_at
            } else {
                Value::from(utc_now_iso())
            };
            let mut payload = json!({
                "channelId": channel_id,
                "messageId": message_id,
                "readerId": session.user_id,
                "readAt": read_at,
                "complete": complete,
            });
            if readers.is_array() {
                payload["readers"] = readers;
            }
            tracing::info!(
                %channel_id,
                reader_id = %session.user_id,
                complete,
                "Read receipt from user"
            );
            state
                .broadcaster
                .broadcast(
                    &channel_id,
                    ServerEvent::new(crate::protocol::events::MESSAGE_READ, payload),
                    Some(&session.connection_id),
                )
                .await;
            None
        }

        ClientEvent::TypingStart { channel_id } => {
            // Only members hold typing state; disconnect cleanup walks memberships
            if !state
                .channels
                .is_member(&channel_id, &session.connection_id)
                .await
            {
                return Some(ServerEvent::error(
                    "NOT_A_MEMBER",
                    format!("join {} before typing in it", channel_id),
                ));
            }
            state.typing.start(&channel_id, &session.user_id).await;
            state
                .broadcaster
                .broadcast(
                    &channel_id,
                    ServerEvent::typing(&channel_id, &session.user_id, true),
                    Some(&session.connection_id),
                )
                .await;
            None
        }

        ClientEvent::TypingStop { channel_id } => {
            state.typing.stop(&channel_id, &session.user_id).await;
            state
                .broadcaster
                .broadcast(
                    &channel_id,
                    ServerEvent::typing(&channel_id, &session.user_id, false),
                    Some(&session.connection_id),
                )
                .await;
            None
        }
    }
}

async fn handle_channel_init(
    state: &Arc<AppState>,
    session: &Session,
    channel_id: ChannelId,
    metadata: Value,
) -> Option<ServerEvent> {
    let member = state.sessions.member(&session.connection_id).await?;
    let admission = state.channels.init(&channel_id, member).await;
    tracing::info!(%channel_id, created = admission.created, %metadata, "Channel init");

    if admission.added {
        announce_join(state, session, &channel_id).await;
    }
    Some(ServerEvent::channel_initialized(&channel_id, admission.created))
}

async fn handle_channel_join(
    state: &Arc<AppState>,
    session: &Session,
    channel_id: ChannelId,
) -> Option<ServerEvent> {
    let member = state.sessions.member(&session.connection_id).await?;
    state.channels.join(&channel_id, member).await;
    announce_join(state, session, &channel_id).await;
    Some(ServerEvent::channel_joined(&channel_id))
}

async fn announce_join(state: &Arc<AppState>, session: &Session, channel_id: &str) {
    let notified = state
        .broadcaster
        .broadcast(
            channel_id,
            ServerEvent::user_joined(channel_id, &session.user_id, &session.connection_id),
            Some(&session.connection_id),
        )
        .await;
    tracing::debug!(%channel_id, members_notified = notified, "Join announced");
}

async fn handle_channel_leave(
    state: &Arc<AppState>,
    session: &Session,
    channel_id: ChannelId,
) -> Option<ServerEvent> {
    if state
        .channels
        .leave(&channel_id, &session.connection_id)
        .await
        .is_some()
    {
        state
            .broadcaster
            .broadcast(
                &channel_id,
                ServerEvent::user_left(&channel_id, &session.user_id, &session.connection_id),
                Some(&session.connection_id),
            )
            .await;
        clear_typing_if_gone(state, &channel_id, &session.user_id).await;
    }
    Some(ServerEvent::channel_left(&channel_id))
}

/// Tear down a closed connection: release its Session, drop it from every
/// channel, and tell the remaining members.
///
/// Once this returns no broadcast can target the connection.
pub async fn handle_disconnect(state: &Arc<AppState>, connection_id: &str) {
    let session = state.sessions.close(connection_id).await;
    let left = state.channels.remove_connection(connection_id).await;

    let user_id = session.as_ref().map(|s| s.user_id.as_str()).unwrap_or("-");
    tracing::info!(
        %connection_id,
        %user_id,
        channels = left.len(),
        "Client disconnected"
    );

    for (channel_id, member) in left {
        state
            .broadcaster
            .broadcast(
                &channel_id,
                ServerEvent::user_left(&channel_id, &member.user_id, connection_id),
                None,
            )
            .await;
        clear_typing_if_gone(state, &channel_id, &member.user_id).await;
    }
}

/// A user with no connection left in the channel can't be typing there
async fn clear_typing_if_gone(state: &Arc<AppState>, channel_id: &str, user_id: &str) {
    if state.channels.has_user(channel_id, user_id).await {
        return;
    }
    if state.typing.stop(channel_id, user_id).await {
        state
            .broadcaster
            .broadcast(channel_id, ServerEvent::typing(channel_id, user_id, false), None)
            .await;
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
