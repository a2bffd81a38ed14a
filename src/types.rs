use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Opaque ID types
pub type ChannelId = String;
pub type ConnectionId = String;
pub type UserId = String;
pub type ProcessId = String;

/// Generate a fresh, globally unique identifier (connections, processes)
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Lifecycle of a transport-level connection
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Closed,
}

/// Identity attributes resolved from a credential lookup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: UserId,
    pub session_id: Option<String>,
    /// The full stored record, kept verbatim
    pub raw: Map<String, Value>,
}

impl Claims {
    /// Parse a stored claims record.
    ///
    /// Accepts `userId` or `user_id` (string or number) and optionally
    /// `sessionId` or `session_id`. Returns a description of the problem
    /// when the record is not a JSON object or carries no usable user id.
    pub fn parse(stored: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(stored).map_err(|e| format!("invalid JSON: {}", e))?;
        let Value::Object(raw) = value else {
            return Err("claims record is not an object".to_string());
        };

        let user_id = first_id(&raw, &["userId", "user_id"])
            .ok_or_else(|| "claims record has no user id".to_string())?;
        let session_id = first_id(&raw, &["sessionId", "session_id"]);

        Ok(Self {
            user_id,
            session_id,
            raw,
        })
    }
}

/// Read the first non-empty string or numeric id among `keys`
fn first_id(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Authenticated identity bound to exactly one connection.
///
/// Immutable once created; re-authentication requires a new connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub session_id: Option<String>,
    pub claims: Arc<Claims>,
    pub authenticated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(connection_id: ConnectionId, claims: Claims) -> Self {
        Self {
            connection_id,
            user_id: claims.user_id.clone(),
            session_id: claims.session_id.clone(),
            claims: Arc::new(claims),
            authenticated_at: Utc::now(),
        }
    }
}

/// Channel key for an id given as string or number, trimmed.
///
/// Socket frames and webhooks both go through here so they address the same
/// channel. Other JSON types are not channel ids.
pub fn channel_key(value: &Value) -> Option<ChannelId> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Loose truthiness for flags the host application may send as bool, number or string
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Current time as RFC 3339 with a `Z` suffix, the format clients expect
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camel_case_claims() {
        let claims = Claims::parse(r#"{"userId": "u1", "sessionId": "s1", "role": "agent"}"#)
            .unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.session_id.as_deref(), Some("s1"));
        assert_eq!(claims.raw.get("role"), Some(&Value::from("agent")));
    }

    #[test]
    fn test_parse_snake_case_and_numeric_ids() {
        let claims = Claims::parse(r#"{"user_id": 42, "session_id": 7}"#).unwrap();
        assert_eq!(claims.user_id, "42");
        assert_eq!(claims.session_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_parse_without_session_id() {
        let claims = Claims::parse(r#"{"userId": "u1"}"#).unwrap();
        assert!(claims.session_id.is_none());
    }

    #[test]
    fn test_parse_rejects_malformed_records() {
        assert!(Claims::parse("not json").is_err());
        assert!(Claims::parse("[1, 2]").is_err());
        assert!(Claims::parse(r#"{"sessionId": "s1"}"#).is_err());
        assert!(Claims::parse(r#"{"userId": ""}"#).is_err());
        assert!(Claims::parse(r#"{"userId": null}"#).is_err());
    }

    #[test]
    fn test_session_shares_claims() {
        let claims = Claims::parse(r#"{"userId": "u1", "sessionId": "s1"}"#).unwrap();
        let session = Session::new("conn-1".to_string(), claims);
        let copy = session.clone();
        assert_eq!(copy.user_id, "u1");
        assert_eq!(copy.session_id.as_deref(), Some("s1"));
        assert!(Arc::ptr_eq(&session.claims, &copy.claims));
    }

    #[test]
    fn test_channel_key() {
        assert_eq!(channel_key(&Value::from(" chat_1 ")).as_deref(), Some("chat_1"));
        assert_eq!(channel_key(&Value::from(42)).as_deref(), Some("42"));
        assert_eq!(channel_key(&Value::from("")).as_deref(), Some(""));
        assert!(channel_key(&Value::Bool(true)).is_none());
        assert!(channel_key(&serde_json::json!({"id": 1})).is_none());
        assert!(channel_key(&Value::Null).is_none());
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy(&Value::Bool(true)));
        assert!(is_truthy(&Value::from(1)));
        assert!(is_truthy(&Value::from("yes")));
        assert!(!is_truthy(&Value::Bool(false)));
        assert!(!is_truthy(&Value::from(0)));
        assert!(!is_truthy(&Value::from("")));
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn test_utc_now_iso_uses_z_suffix() {
        assert!(utc_now_iso().ends_with('Z'));
    }
}
