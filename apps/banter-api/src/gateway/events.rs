//! Wire-format messages: client ops, their payloads, and server events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Client ops
// ---------------------------------------------------------------------------

pub const OP_AUTHENTICATE: &str = "authenticate";
pub const OP_RESUME: &str = "resume";
pub const OP_JOIN_ROOM: &str = "join_room";
pub const OP_LEAVE_ROOM: &str = "leave_room";
pub const OP_SEND_MESSAGE: &str = "send_message";
pub const OP_START_TYPING: &str = "start_typing";
pub const OP_STOP_TYPING: &str = "stop_typing";
pub const OP_UPDATE_PRESENCE: &str = "update_presence";
pub const OP_PING: &str = "ping";

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: String,
    #[serde(default)]
    pub d: Value,
}

// ---------------------------------------------------------------------------
// Client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResumePayload {
    pub session_id: String,
    pub token: String,
    pub last_seq: u64,
}

#[derive(Debug, Deserialize)]
pub struct RoomPayload {
    pub room_id: String,
}

fn default_kind() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub room_id: String,
    pub content: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct PresencePayload {
    pub status: String,
}

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
///
/// Broadcast-delivered events carry a per-session sequence number `s` so a
/// resuming client can tell the server what it has already seen; direct
/// replies omit it.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    pub t: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl ServerMessage {
    /// Build a sequenced event (fan-out delivery, ready/resumed).
    pub fn event(name: &str, seq: u64, data: Value) -> Self {
        Self {
            t: name.to_string(),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a direct reply with no sequence number.
    pub fn reply(name: &str, data: Value) -> Self {
        Self {
            t: name.to_string(),
            s: None,
            d: data,
        }
    }
}

// ---------------------------------------------------------------------------
// Server event names
// ---------------------------------------------------------------------------

pub struct EventName;

impl EventName {
    pub const READY: &'static str = "ready";
    pub const RESUMED: &'static str = "resumed";
    pub const RECONNECT: &'static str = "reconnect";
    pub const ROOM_JOINED: &'static str = "room_joined";
    pub const ROOM_LEFT: &'static str = "room_left";
    pub const MESSAGE_SENT: &'static str = "message_sent";
    pub const MESSAGE_RECEIVED: &'static str = "message_received";
    pub const USER_JOINED: &'static str = "user_joined";
    pub const USER_LEFT: &'static str = "user_left";
    pub const USER_TYPING: &'static str = "user_typing";
    pub const USER_STOPPED_TYPING: &'static str = "user_stopped_typing";
    pub const PRESENCE_UPDATED: &'static str = "presence_updated";
    pub const PRESENCE_CHANGED: &'static str = "presence_changed";
    pub const PONG: &'static str = "pong";
    pub const RATE_LIMIT_EXCEEDED: &'static str = "rate_limit_exceeded";
    pub const JOIN_ROOM_ERROR: &'static str = "join_room_error";
    pub const LEAVE_ROOM_ERROR: &'static str = "leave_room_error";
    pub const SEND_MESSAGE_ERROR: &'static str = "send_message_error";
    pub const UPDATE_PRESENCE_ERROR: &'static str = "update_presence_error";
}
