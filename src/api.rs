//! HTTP endpoints.
//!
//! The webhook endpoints let the host application push notifications into
//! channels. They go straight to the broadcaster: no membership checks, no
//! sender exclusion.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::protocol::{events, ServerEvent};
use crate::state::AppState;
use crate::types::{channel_key, is_truthy, utc_now_iso};

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Server secret missing")]
    SecretNotConfigured,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid JSON")]
    InvalidJson(String),

    #[error("{0}")]
    MissingFields(&'static str),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::SecretNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::Unauthorized => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidJson(_) | WebhookError::MissingFields(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<JsonRejection> for WebhookError {
    fn from(rejection: JsonRejection) -> Self {
        WebhookError::InvalidJson(rejection.body_text())
    }
}

/// Body of `POST /chat/message`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePersisted {
    pub channel_id: Option<Value>,
    pub message_id: Option<Value>,
    pub sender_id: Option<Value>,
    pub content: Option<Value>,
    pub timestamp: Option<String>,
    pub sender_name: Option<Value>,
}

/// Body of `POST /chat/read-receipt`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub channel_id: Option<Value>,
    pub message_id: Option<Value>,
    pub reader_id: Option<Value>,
    pub read_at: Option<Value>,
    #[serde(default)]
    pub complete: Value,
    pub readers: Option<Value>,
}

/// Present and not empty, the way the host application means "provided"
fn provided(value: &Option<Value>) -> Option<&Value> {
    value.as_ref().filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    })
}

/// Trimmed channel key; blank or non-scalar ids count as missing
fn webhook_channel(value: &Option<Value>) -> Option<String> {
    value
        .as_ref()
        .and_then(channel_key)
        .filter(|key| !key.is_empty())
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": utc_now_iso() }))
}

/// GET /status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "uptime": state.uptime_secs(),
        "processId": state.process_id,
        "connections": state.sessions.connection_count().await,
        "channels": state.channels.channel_count().await,
    }))
}

/// POST /chat/message
///
/// The host application persisted a message; relay it as `message:received`.
pub async fn chat_message(
    State(state): State<Arc<AppState>>,
    body: Result<Json<MessagePersisted>, JsonRejection>,
) -> Result<Json<Value>, WebhookError> {
    let Json(body) = body?;

    let (Some(room), Some(sender_id), Some(content), Some(message_id)) = (
        webhook_channel(&body.channel_id),
        provided(&body.sender_id),
        provided(&body.content),
        provided(&body.message_id),
    ) else {
        return Err(WebhookError::MissingFields(
            "channelId, senderId, content, and messageId are required",
        ));
    };

    let mut payload = Map::new();
    payload.insert("channelId".into(), Value::from(room.as_str()));
    payload.insert("senderId".into(), sender_id.clone());
    payload.insert("content".into(), content.clone());
    payload.insert("messageId".into(), message_id.clone());
    payload.insert(
        "timestamp".into(),
        Value::from(
            body.timestamp
                .filter(|t| !t.is_empty())
                .unwrap_or_else(utc_now_iso),
        ),
    );
    if let Some(sender_name) = body.sender_name {
        payload.insert("senderName".into(), sender_name);
    }

    let delivered = state
        .broadcaster
        .broadcast(
            &room,
            ServerEvent::new(events::MESSAGE_RECEIVED, Value::Object(payload)),
            None,
        )
        .await;

    tracing::info!(channel_id = %room, %message_id, delivered, "Broadcast chat message from webhook");
    Ok(Json(json!({ "success": true })))
}

/// POST /chat/read-receipt
pub async fn read_receipt(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ReadReceipt>, JsonRejection>,
) -> Result<Json<Value>, WebhookError> {
    let Json(body) = body?;

    let (Some(room), Some(message_id)) =
        (webhook_channel(&body.channel_id), provided(&body.message_id))
    else {
        return Err(WebhookError::MissingFields(
            "channelId and messageId are required",
        ));
    };

    let complete = is_truthy(&body.complete);
    let mut payload = Map::new();
    payload.insert("channelId".into(), Value::from(room.as_str()));
    payload.insert("messageId".into(), message_id.clone());
    payload.insert("complete".into(), Value::Bool(complete));
    if let Some(reader_id) = body.reader_id {
        payload.insert("readerId".into(), reader_id);
    }
    if let Some(read_at) = body.read_at {
        payload.insert("readAt".into(), read_at);
    }
    if let Some(readers @ Value::Array(_)) = body.readers {
        payload.insert("readers".into(), readers);
    }

    let delivered = state
        .broadcaster
        .broadcast(
            &room,
            ServerEvent::new(events::MESSAGE_READ, Value::Object(payload)),
            None,
        )
        .await;

    tracing::info!(
        channel_id = %room,
        %message_id,
        complete,
        delivered,
        "Broadcast read receipt from webhook"
    );
    Ok(Json(json!({ "success": true })))
}
