pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::{AuthError, LiveConnection};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Token from `?token=` or an `Authorization: Bearer` header
fn connection_token(params: WsQuery, headers: &HeaderMap) -> Option<String> {
    params.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
    })
}

/// WebSocket upgrade handler.
///
/// The credential check runs before the upgrade; a rejected client never
/// gets a socket and so can't emit any channel event.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = connection_token(params, &headers);

    let connection = match state.open_connection(token.as_deref()).await {
        Ok(connection) => connection,
        Err(e) => return refuse_connection(&e),
    };

    let connection_id = connection.session.connection_id.clone();
    let cleanup_state = state.clone();

    ws.on_failed_upgrade(move |e| {
        tracing::warn!(%connection_id, error = %e, "WebSocket upgrade failed");
        tokio::spawn(async move {
            handlers::handle_disconnect(&cleanup_state, &connection_id).await;
        });
    })
    .on_upgrade(move |socket| handle_socket(socket, connection, state))
}

/// HTTP answer for a refused connection: an unhealthy store is an
/// infrastructure fault (503), anything else a bad credential (401)
fn refuse_connection(err: &AuthError) -> Response {
    match err {
        AuthError::StoreUnavailable(e) => {
            tracing::error!(error = %e, "Refusing connection, credential store unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "Credential store unavailable").into_response()
        }
        e => {
            tracing::warn!(error = %e, "Refusing connection");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

async fn send_event(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    match event.to_json() {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(event = %event.event, error = %e, "Failed to encode event");
            Ok(())
        }
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, connection: LiveConnection, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let LiveConnection {
        session,
        mut events,
    } = connection;
    let connection_id = session.connection_id.clone();

    if send_event(&mut sender, &ServerEvent::connected(&session))
        .await
        .is_err()
    {
        tracing::warn!(%connection_id, "Failed to send connected event");
        handlers::handle_disconnect(&state, &connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            // Events broadcast to this connection
            outbound = events.recv() => {
                match outbound {
                    Some(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Handle client frames
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(%connection_id, "Received frame: {}", text.as_str());

                        let reply = match serde_json::from_str::<ClientEvent>(text.as_str()) {
                            Ok(event) => handlers::handle_event(event, &session, &state).await,
                            Err(e) => {
                                tracing::warn!(%connection_id, error = %e, "Failed to parse client event");
                                Some(ServerEvent::error(
                                    "PARSE_ERROR",
                                    format!("Invalid event format: {}", e),
                                ))
                            }
                        };

                        if let Some(reply) = reply {
                            if send_event(&mut sender, &reply).await.is_err() {
                                tracing::warn!(%connection_id, "Failed to send reply");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(%connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }

            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    handlers::handle_disconnect(&state, &connection_id).await;
}
