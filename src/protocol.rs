use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message as it travels between server and clients.
///
/// Inbound chat frames carry only opaque text; every field here is stamped
/// server-side from the connection's authenticated identity before the
/// message reaches the hub. The same record is what the store persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub content: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a message stamped with a fresh id and the current time.
    pub fn stamped(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            content: content.into(),
            username: username.into(),
            created_at: Utc::now(),
        }
    }
}

/// A WebRTC signaling envelope, routed to one named target within a room.
///
/// Clients only control `type`, `target_id` and `data`; the reader loop
/// overwrites everything else before the envelope is routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl SignalingMessage {
    /// Event delivered to remaining room members when a peer's connection ends.
    pub fn peer_disconnected(room_id: &str, user_id: &str, username: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            msg_type: "peer-disconnected".to_string(),
            room_id: room_id.to_string(),
            sender_id: user_id.to_string(),
            target_id: String::new(),
            data: serde_json::Value::Null,
            username: username.to_string(),
            created_at: Some(Utc::now()),
        }
    }

    /// Synthetic reply sent back to a sender whose target is not in the room.
    pub fn target_not_found(room_id: &str, sender_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            msg_type: "error".to_string(),
            room_id: room_id.to_string(),
            sender_id: "system".to_string(),
            target_id: sender_id.to_string(),
            data: serde_json::json!({
                "error": "target_not_found",
                "message": "Target user is not connected",
            }),
            username: String::new(),
            created_at: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_round_trips() {
        let msg = ChatMessage::stamped("r1", "u1", "alice", "hello");
        let json = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.room_id, "r1");
        assert_eq!(back.user_id, "u1");
        assert_eq!(back.content, "hello");
        assert!(!back.id.is_empty());
    }

    #[test]
    fn signaling_envelope_uses_wire_field_names() {
        let msg = SignalingMessage::peer_disconnected("r1", "u1", "alice");
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "peer-disconnected");
        assert_eq!(json["room_id"], "r1");
        assert_eq!(json["sender_id"], "u1");
        assert!(json["created_at"].is_string());
    }

    #[test]
    fn minimal_inbound_envelope_deserializes_with_defaults() {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"offer","target_id":"b","data":{"sdp":"x"}}"#).unwrap();
        assert_eq!(msg.msg_type, "offer");
        assert_eq!(msg.target_id, "b");
        assert_eq!(msg.data["sdp"], "x");
        assert!(msg.sender_id.is_empty());
        assert!(msg.created_at.is_none());
    }

    #[test]
    fn error_reply_names_the_failure() {
        let msg = SignalingMessage::target_not_found("r1", "a");
        assert_eq!(msg.msg_type, "error");
        assert_eq!(msg.sender_id, "system");
        assert_eq!(msg.target_id, "a");
        assert_eq!(msg.data["error"], "target_not_found");
    }
}
