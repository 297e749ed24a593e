use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const EVENT_REGISTER_SESSION: &str = "register_session";
pub const EVENT_CHAT_REQUEST: &str = "chat_request";
pub const EVENT_PING: &str = "ping";

pub const EVENT_SESSION_REGISTERED: &str = "session_registered";
pub const EVENT_PONG: &str = "pong";
pub const EVENT_CHAT_STARTED: &str = "chat_started";
pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_FINAL_NOTIFICATION: &str = "final_notification";
pub const EVENT_LIVESTATUS: &str = "livestatus";
pub const EVENT_CHAT_ERROR: &str = "chat_error";

/// Close code used for every authentication and authorization failure.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code used when `register_session` carries unusable data.
pub const CLOSE_REGISTRATION_FAILED: u16 = 1011;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_NORMAL: u16 = 1000;

/// A `{"event": ..., "data": {...}}` text frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> String {
        // Serializing a String key + Value cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.str_field("session_id")
    }
}

pub fn session_registered(session_id: &str, env: &str, ui_source: Option<&str>) -> Frame {
    Frame::new(
        EVENT_SESSION_REGISTERED,
        json!({
            "session_id": session_id,
            "message": "Session registered successfully",
            "env": env,
            "uisource": ui_source,
        }),
    )
}

pub fn pong(session_id: &str, client_timestamp: Option<Value>, server_time_ms: i64) -> Frame {
    Frame::new(
        EVENT_PONG,
        json!({
            "session_id": session_id,
            "message": "pong",
            "timestamp": client_timestamp.unwrap_or(Value::Null),
            "server_time": server_time_ms,
        }),
    )
}

pub fn chat_started(session_id: &str) -> Frame {
    Frame::new(
        EVENT_CHAT_STARTED,
        json!({
            "session_id": session_id,
            "message": "Processing your request...",
        }),
    )
}

pub fn chat_error(session_id: &str, error: &str, message: &str) -> Frame {
    Frame::new(
        EVENT_CHAT_ERROR,
        json!({
            "session_id": session_id,
            "error": error,
            "message": message,
        }),
    )
}
