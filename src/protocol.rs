use crate::types::*;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Outbound event names
pub mod events {
    pub const CONNECTED: &str = "connected";
    pub const ERROR: &str = "error";
    pub const CHANNEL_INITIALIZED: &str = "channel:initialized";
    pub const CHANNEL_JOINED: &str = "channel:joined";
    pub const CHANNEL_LEFT: &str = "channel:left";
    pub const USER_JOINED: &str = "user:joined";
    pub const USER_LEFT: &str = "user:left";
    pub const MESSAGE_RECEIVED: &str = "message:received";
    pub const MESSAGE_READ: &str = "message:read";
    pub const TYPING_USER: &str = "typing:user";
}

/// Inbound socket events, framed as `{"event": "...", "data": {...}}`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "channel:init")]
    ChannelInit {
        #[serde(deserialize_with = "channel_id")]
        channel_id: ChannelId,
        #[serde(default)]
        metadata: Value,
    },
    #[serde(rename = "channel:join")]
    ChannelJoin {
        #[serde(deserialize_with = "channel_id")]
        channel_id: ChannelId,
    },
    #[serde(rename = "channel:leave")]
    ChannelLeave {
        #[serde(deserialize_with = "channel_id")]
        channel_id: ChannelId,
    },
    #[serde(rename = "message:send")]
    MessageSend {
        #[serde(deserialize_with = "channel_id")]
        channel_id: ChannelId,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        metadata: Value,
    },
    /// Relay an arbitrary named event to the channel
    #[serde(rename = "broadcast")]
    Broadcast {
        #[serde(deserialize_with = "channel_id")]
        channel_id: ChannelId,
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default = "default_true")]
        exclude_sender: bool,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        #[serde(deserialize_with = "channel_id")]
        channel_id: ChannelId,
        #[serde(default)]
        message_id: Value,
        #[serde(default)]
        read_at: Value,
        #[serde(default)]
        complete: Value,
        #[serde(default)]
        readers: Value,
    },
    #[serde(rename = "typing:start")]
    TypingStart {
        #[serde(deserialize_with = "channel_id")]
        channel_id: ChannelId,
    },
    #[serde(rename = "typing:stop")]
    TypingStop {
        #[serde(deserialize_with = "channel_id")]
        channel_id: ChannelId,
    },
}

impl ClientEvent {
    pub fn channel_id(&self) -> &str {
        match self {
            ClientEvent::ChannelInit { channel_id, .. }
            | ClientEvent::ChannelJoin { channel_id }
            | ClientEvent::ChannelLeave { channel_id }
            | ClientEvent::MessageSend { channel_id, .. }
            | ClientEvent::Broadcast { channel_id, .. }
            | ClientEvent::MessageRead { channel_id, .. }
            | ClientEvent::TypingStart { channel_id }
            | ClientEvent::TypingStop { channel_id } => channel_id,
        }
    }

    /// Wire name of the event, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::ChannelInit { .. } => "channel:init",
            ClientEvent::ChannelJoin { .. } => "channel:join",
            ClientEvent::ChannelLeave { .. } => "channel:leave",
            ClientEvent::MessageSend { .. } => "message:send",
            ClientEvent::Broadcast { .. } => "broadcast",
            ClientEvent::MessageRead { .. } => "message:read",
            ClientEvent::TypingStart { .. } => "typing:start",
            ClientEvent::TypingStop { .. } => "typing:stop",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Channel ids arrive as strings or numbers; both map to the same channel
fn channel_id<'de, D>(deserializer: D) -> Result<ChannelId, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    channel_key(&value)
        .ok_or_else(|| serde::de::Error::custom("channelId must be a string or number"))
}

/// Outbound event: a name plus an opaque payload forwarded verbatim
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEvent {
    pub event: String,
    pub data: Value,
}

impl ServerEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn connected(session: &Session) -> Self {
        Self::new(
            events::CONNECTED,
            json!({
                "socketId": session.connection_id,
                "userId": session.user_id,
                "sessionId": session.session_id,
            }),
        )
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            events::ERROR,
            json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn channel_initialized(channel_id: &str, created: bool) -> Self {
        Self::new(
            events::CHANNEL_INITIALIZED,
            json!({ "channelId": channel_id, "success": true, "created": created }),
        )
    }

    pub fn channel_joined(channel_id: &str) -> Self {
        Self::new(
            events::CHANNEL_JOINED,
            json!({ "channelId": channel_id, "success": true }),
        )
    }

    pub fn channel_left(channel_id: &str) -> Self {
        Self::new(
            events::CHANNEL_LEFT,
            json!({ "channelId": channel_id, "success": true }),
        )
    }

    pub fn user_joined(channel_id: &str, user_id: &str, connection_id: &str) -> Self {
        Self::new(
            events::USER_JOINED,
            json!({ "userId": user_id, "socketId": connection_id, "channelId": channel_id }),
        )
    }

    pub fn user_left(channel_id: &str, user_id: &str, connection_id: &str) -> Self {
        Self::new(
            events::USER_LEFT,
            json!({ "userId": user_id, "socketId": connection_id, "channelId": channel_id }),
        )
    }

    pub fn typing(channel_id: &str, user_id: &str, active: bool) -> Self {
        Self::new(
            events::TYPING_USER,
            json!({ "channelId": channel_id, "userId": user_id, "active": active }),
        )
    }

    /// `message:received` for a message sent over a socket.
    ///
    /// Fields of an object `data` are forwarded verbatim; the server-side
    /// attribution fields take precedence over same-named client fields.
    pub fn message_from_socket(
        channel_id: &str,
        session: &Session,
        data: Value,
        metadata: Value,
    ) -> Self {
        let mut payload = match data {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        payload.insert("channelId".to_string(), Value::from(channel_id));
        payload.insert(
            "senderId".to_string(),
            Value::from(session.user_id.as_str()),
        );
        payload.insert(
            "socketId".to_string(),
            Value::from(session.connection_id.as_str()),
        );
        payload.insert("timestamp".to_string(), Value::from(utc_now_iso()));
        payload.insert(
            "metadata".to_string(),
            if metadata.is_null() {
                json!({})
            } else {
                metadata
            },
        );
        Self::new(events::MESSAGE_RECEIVED, Value::Object(payload))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
