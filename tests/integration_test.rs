use aeolus::backplane::{Backplane, MemoryBackplane};
use aeolus::broadcast::spawn_backplane_listener;
use aeolus::config::RelayConfig;
use aeolus::credentials::MemoryCredentialStore;
use aeolus::protocol::{events, ClientEvent, ServerEvent};
use aeolus::session::{AuthError, LiveConnection};
use aeolus::state::AppState;
use aeolus::ws::handlers::{handle_disconnect, handle_event};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const USERS: &[(&str, &str)] = &[
    ("tok-alice", r#"{"userId": "alice", "sessionId": "s-1"}"#),
    ("tok-bob", r#"{"userId": "bob"}"#),
    ("tok-carol", r#"{"userId": 7}"#),
];

async fn credential_store() -> MemoryCredentialStore {
    let store = MemoryCredentialStore::new();
    for (token, claims) in USERS {
        store
            .insert(format!("tc2:socket:auth:{}", token), *claims)
            .await;
    }
    store
}

async fn relay(backplane: Option<Arc<dyn Backplane>>) -> Arc<AppState> {
    Arc::new(AppState::new(
        RelayConfig::default(),
        Arc::new(credential_store().await),
        backplane,
    ))
}

async fn connect(state: &Arc<AppState>, token: &str) -> LiveConnection {
    state
        .open_connection(Some(token))
        .await
        .expect("token should be accepted")
}

fn event(value: Value) -> ClientEvent {
    serde_json::from_value(value).expect("client event should parse")
}

async fn send(state: &Arc<AppState>, conn: &LiveConnection, value: Value) -> Option<ServerEvent> {
    handle_event(event(value), &conn.session, state).await
}

async fn join(state: &Arc<AppState>, conn: &LiveConnection, channel_id: &str) {
    let reply = send(
        state,
        conn,
        json!({"event": "channel:join", "data": {"channelId": channel_id}}),
    )
    .await;
    assert_eq!(reply, Some(ServerEvent::channel_joined(channel_id)));
}

/// Everything queued for a connection right now
fn drain(conn: &mut LiveConnection) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = conn.events.try_recv() {
        out.push(event);
    }
    out
}

async fn next_event(conn: &mut LiveConnection) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), conn.events.recv())
        .await
        .expect("event should arrive in time")
        .expect("event queue should be open")
}

/// Wait until nothing more arrives for a short while
async fn settle(conn: &mut LiveConnection) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(100), conn.events.recv()).await
    {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_message_send_reaches_others_but_not_sender() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let mut c2 = connect(&state, "tok-bob").await;

    join(&state, &c1, "chat-123").await;
    join(&state, &c2, "chat-123").await;
    drain(&mut c1);
    drain(&mut c2);

    let reply = send(
        &state,
        &c1,
        json!({"event": "message:send", "data": {"channelId": "chat-123", "data": {"text": "hi"}}}),
    )
    .await;
    assert!(reply.is_none());

    let received = drain(&mut c2);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event, events::MESSAGE_RECEIVED);
    assert_eq!(received[0].data["text"], "hi");
    assert_eq!(received[0].data["channelId"], "chat-123");
    assert_eq!(received[0].data["senderId"], "alice");
    assert_eq!(received[0].data["socketId"], c1.session.connection_id.as_str());

    assert!(drain(&mut c1).is_empty());
}

#[tokio::test]
async fn test_join_announces_to_existing_members() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let mut c2 = connect(&state, "tok-bob").await;

    let reply = send(
        &state,
        &c1,
        json!({"event": "channel:init", "data": {"channelId": "room", "metadata": {"topic": "x"}}}),
    )
    .await;
    assert_eq!(reply, Some(ServerEvent::channel_initialized("room", true)));

    join(&state, &c2, "room").await;
    let announced = drain(&mut c1);
    assert_eq!(
        announced,
        vec![ServerEvent::user_joined("room", "bob", &c2.session.connection_id)]
    );
    assert!(drain(&mut c2).is_empty());

    // Init on an existing channel joins it
    let mut c3 = connect(&state, "tok-carol").await;
    let reply = send(
        &state,
        &c3,
        json!({"event": "channel:init", "data": {"channelId": "room"}}),
    )
    .await;
    assert_eq!(reply, Some(ServerEvent::channel_initialized("room", false)));
    assert_eq!(state.channels.member_count("room").await, 3);
    assert_eq!(drain(&mut c1).len(), 1);
    assert_eq!(drain(&mut c2).len(), 1);
    assert!(drain(&mut c3).is_empty());
}

#[tokio::test]
async fn test_leave_is_acknowledged_and_announced() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let c2 = connect(&state, "tok-bob").await;

    join(&state, &c1, "room").await;
    join(&state, &c2, "room").await;
    drain(&mut c1);

    let reply = send(
        &state,
        &c2,
        json!({"event": "channel:leave", "data": {"channelId": "room"}}),
    )
    .await;
    assert_eq!(reply, Some(ServerEvent::channel_left("room")));
    assert_eq!(
        drain(&mut c1),
        vec![ServerEvent::user_left("room", "bob", &c2.session.connection_id)]
    );

    // Leaving again, or leaving an unknown channel, is a no-op
    let reply = send(
        &state,
        &c2,
        json!({"event": "channel:leave", "data": {"channelId": "nowhere"}}),
    )
    .await;
    assert_eq!(reply, Some(ServerEvent::channel_left("nowhere")));
    assert!(drain(&mut c1).is_empty());
}

#[tokio::test]
async fn test_broadcast_exclude_sender_flag() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let mut c2 = connect(&state, "tok-bob").await;
    join(&state, &c1, "room").await;
    join(&state, &c2, "room").await;
    drain(&mut c1);
    drain(&mut c2);

    send(
        &state,
        &c1,
        json!({"event": "broadcast", "data": {"channelId": "room", "event": "poll:update", "data": {"votes": 3}}}),
    )
    .await;
    assert!(drain(&mut c1).is_empty());
    assert_eq!(
        drain(&mut c2),
        vec![ServerEvent::new("poll:update", json!({"votes": 3}))]
    );

    send(
        &state,
        &c1,
        json!({"event": "broadcast", "data": {"channelId": "room", "event": "poll:update", "data": {}, "excludeSender": false}}),
    )
    .await;
    assert_eq!(drain(&mut c1).len(), 1);
    assert_eq!(drain(&mut c2).len(), 1);
}

#[tokio::test]
async fn test_message_read_from_socket() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let mut c2 = connect(&state, "tok-bob").await;
    join(&state, &c1, "room").await;
    join(&state, &c2, "room").await;
    drain(&mut c1);

    send(
        &state,
        &c2,
        json!({"event": "message:read", "data": {"channelId": "room", "messageId": "m-1", "complete": true}}),
    )
    .await;

    let receipts = drain(&mut c1);
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].event, events::MESSAGE_READ);
    assert_eq!(receipts[0].data["messageId"], "m-1");
    assert_eq!(receipts[0].data["readerId"], "bob");
    assert_eq!(receipts[0].data["complete"], true);
    assert!(receipts[0].data["readAt"].is_string());
    assert!(drain(&mut c2).is_empty());

    let reply = send(
        &state,
        &c2,
        json!({"event": "message:read", "data": {"channelId": "room", "messageId": ""}}),
    )
    .await;
    assert_eq!(reply.map(|r| r.event), Some(events::ERROR.to_string()));
}

#[tokio::test]
async fn test_message_read_coerces_loose_fields() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let c2 = connect(&state, "tok-bob").await;
    join(&state, &c1, "room").await;
    join(&state, &c2, "room").await;
    drain(&mut c1);

    send(
        &state,
        &c2,
        json!({"event": "message:read", "data": {
            "channelId": "room", "messageId": "m-1", "complete": null, "readers": "bob"
        }}),
    )
    .await;
    let receipt = drain(&mut c1).pop().expect("receipt broadcast");
    assert_eq!(receipt.data["complete"], false);
    assert!(receipt.data.get("readers").is_none());

    send(
        &state,
        &c2,
        json!({"event": "message:read", "data": {
            "channelId": "room", "messageId": "m-2", "complete": 1, "readAt": "",
            "readers": ["alice"]
        }}),
    )
    .await;
    let receipt = drain(&mut c1).pop().expect("receipt broadcast");
    assert_eq!(receipt.data["complete"], true);
    assert_eq!(receipt.data["readers"], json!(["alice"]));
    assert!(!receipt.data["readAt"].as_str().unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_typing_requires_membership() {
    let state = relay(None).await;
    let c1 = connect(&state, "tok-alice").await;

    let reply = send(
        &state,
        &c1,
        json!({"event": "typing:start", "data": {"channelId": "elsewhere"}}),
    )
    .await
    .expect("error reply");
    assert_eq!(reply.event, events::ERROR);
    assert_eq!(reply.data["code"], "NOT_A_MEMBER");
    assert!(!state.typing.is_typing("elsewhere", "alice").await);
}

#[tokio::test]
async fn test_empty_channel_id_is_an_error() {
    let state = relay(None).await;
    let c1 = connect(&state, "tok-alice").await;

    let reply = send(
        &state,
        &c1,
        json!({"event": "channel:join", "data": {"channelId": ""}}),
    )
    .await
    .expect("error reply");
    assert_eq!(reply.event, events::ERROR);
    assert_eq!(reply.data["code"], "INVALID_CHANNEL");
    assert_eq!(state.channels.channel_count().await, 0);
}

#[tokio::test]
async fn test_disconnect_removes_from_every_channel() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let c2 = connect(&state, "tok-bob").await;

    for channel in ["a", "b"] {
        join(&state, &c1, channel).await;
        join(&state, &c2, channel).await;
    }
    drain(&mut c1);

    handle_disconnect(&state, &c2.session.connection_id).await;

    let left = drain(&mut c1);
    assert_eq!(left.len(), 2);
    assert!(left.iter().all(|e| e.event == events::USER_LEFT));
    assert!(state.channels.channels_of(&c2.session.connection_id).await.is_empty());
    assert_eq!(state.sessions.connection_count().await, 1);

    // Later broadcasts never reach the closed connection
    for channel in ["a", "b"] {
        let delivered = state
            .broadcaster
            .broadcast(channel, ServerEvent::new("ping", json!({})), None)
            .await;
        assert_eq!(delivered, 1);
    }
}

#[tokio::test]
async fn test_typing_start_stop() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let c2 = connect(&state, "tok-bob").await;
    join(&state, &c1, "room").await;
    join(&state, &c2, "room").await;
    drain(&mut c1);

    for _ in 0..3 {
        send(
            &state,
            &c2,
            json!({"event": "typing:start", "data": {"channelId": "room"}}),
        )
        .await;
    }
    assert!(state.typing.is_typing("room", "bob").await);

    send(
        &state,
        &c2,
        json!({"event": "typing:stop", "data": {"channelId": "room"}}),
    )
    .await;
    assert!(!state.typing.is_typing("room", "bob").await);

    let seen = drain(&mut c1);
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[3], ServerEvent::typing("room", "bob", false));
}

#[tokio::test]
async fn test_disconnect_clears_typing() {
    let state = relay(None).await;
    let mut c1 = connect(&state, "tok-alice").await;
    let c2 = connect(&state, "tok-bob").await;
    join(&state, &c1, "room").await;
    join(&state, &c2, "room").await;

    send(
        &state,
        &c2,
        json!({"event": "typing:start", "data": {"channelId": "room"}}),
    )
    .await;
    drain(&mut c1);

    handle_disconnect(&state, &c2.session.connection_id).await;

    assert!(!state.typing.is_typing("room", "bob").await);
    let seen = drain(&mut c1);
    assert!(seen.contains(&ServerEvent::typing("room", "bob", false)));
}

#[tokio::test]
async fn test_invalid_token_has_no_side_effects() {
    let state = relay(None).await;

    let rejected = state.open_connection(Some("nope")).await;
    assert!(matches!(rejected, Err(AuthError::Rejected(_))));

    let missing = state.open_connection(None).await;
    assert!(matches!(missing, Err(AuthError::Rejected(_))));

    assert_eq!(state.sessions.connection_count().await, 0);
    assert_eq!(state.channels.channel_count().await, 0);
}

#[tokio::test]
async fn test_numeric_user_id_claims() {
    let state = relay(None).await;
    let conn = connect(&state, "tok-carol").await;
    assert_eq!(conn.session.user_id, "7");
    assert_eq!(conn.session.session_id, None);
}

#[tokio::test]
async fn test_broadcast_crosses_processes() {
    let bus: Arc<dyn Backplane> = Arc::new(MemoryBackplane::new());
    let a = relay(Some(bus.clone())).await;
    let b = relay(Some(bus)).await;
    spawn_backplane_listener(a.clone()).await.expect("listener A");
    spawn_backplane_listener(b.clone()).await.expect("listener B");

    let mut c1 = connect(&a, "tok-alice").await;
    let mut c2 = connect(&b, "tok-bob").await;

    join(&a, &c1, "chat-123").await;
    join(&b, &c2, "chat-123").await;

    // C2's join on B is announced to C1 on A
    let announced = next_event(&mut c1).await;
    assert_eq!(
        announced,
        ServerEvent::user_joined("chat-123", "bob", &c2.session.connection_id)
    );
    settle(&mut c1).await;
    settle(&mut c2).await;

    send(
        &a,
        &c1,
        json!({"event": "message:send", "data": {"channelId": "chat-123", "data": {"text": "hi"}}}),
    )
    .await;

    let received = next_event(&mut c2).await;
    assert_eq!(received.event, events::MESSAGE_RECEIVED);
    assert_eq!(received.data["text"], "hi");
    assert_eq!(received.data["senderId"], "alice");

    // Neither process hands the event back to its originator
    assert!(settle(&mut c1).await.is_empty());
    assert!(settle(&mut c2).await.is_empty());
}

#[tokio::test]
async fn test_remote_process_honours_exclusion() {
    let bus: Arc<dyn Backplane> = Arc::new(MemoryBackplane::new());
    let a = relay(Some(bus.clone())).await;
    let b = relay(Some(bus)).await;
    spawn_backplane_listener(b.clone()).await.expect("listener B");

    let mut c2 = connect(&b, "tok-bob").await;
    let mut c3 = connect(&b, "tok-carol").await;
    join(&b, &c2, "room").await;
    join(&b, &c3, "room").await;
    settle(&mut c2).await;
    settle(&mut c3).await;

    // A publishes on behalf of C2; B must skip C2
    a.broadcaster
        .broadcast(
            "room",
            ServerEvent::new("custom", json!({"n": 1})),
            Some(&c2.session.connection_id),
        )
        .await;

    assert_eq!(
        next_event(&mut c3).await,
        ServerEvent::new("custom", json!({"n": 1}))
    );
    assert!(settle(&mut c2).await.is_empty());
}
