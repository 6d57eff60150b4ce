//! JSON wire envelope for the real-time channel and inbound dispatch.
//!
//! Every frame is `{"type": <tag>, "payload": <tag-specific>}`. Decoding is a
//! two-step (tag, payload) dispatch so an unknown tag can be told apart from a
//! malformed frame; both are dropped without closing the connection.

use axum::extract::ws::Utf8Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::session::Identity;
use crate::ws::hub::HubHandle;

/// An encoded envelope, ready to be written as a text frame.
/// Cloning shares the underlying buffer, so every connection gets the same bytes.
pub type Frame = Utf8Bytes;

/// Receiver value meaning "everyone".
pub const BROADCAST_RECEIVER: &str = "*";

/// Maximum chat message length (chars).
pub const MAX_CHAT_LENGTH: usize = 2000;

/// Clients may omit `sender` and `timestamp`; the server fills both in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub receiver: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
}

impl ChatMessage {
    /// Build a message stamped with the server clock.
    /// Returns `None` when the content is blank or too long.
    pub fn new(sender: &str, receiver: &str, content: &str) -> Option<Self> {
        let content = normalize_content(content)?;
        let receiver = match receiver.trim() {
            "" => BROADCAST_RECEIVER,
            r => r,
        };
        Some(Self {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content,
            timestamp: Utc::now().to_rfc3339(),
        })
    }
}

/// Trim chat content and enforce the length limit.
pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_CHAT_LENGTH {
        return None;
    }
    Some(trimmed.to_string())
}

/// A connected user as shown in presence snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: i64,
    pub nickname: String,
}

impl From<&Identity> for OnlineUser {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.user_id,
            nickname: identity.nickname.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    ChatMessage(ChatMessage),
    GetOnlineUsers,
    OnlineUsers(Vec<OnlineUser>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown envelope type `{0}`")]
    UnknownType(String),

    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl Envelope {
    pub const CHAT_MESSAGE: &'static str = "chat_message";
    pub const GET_ONLINE_USERS: &'static str = "get_online_users";
    pub const ONLINE_USERS: &'static str = "online_users";

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage(_) => Self::CHAT_MESSAGE,
            Self::GetOnlineUsers => Self::GET_ONLINE_USERS,
            Self::OnlineUsers(_) => Self::ONLINE_USERS,
        }
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(DecodeError::Malformed)?;

        match raw.kind.as_str() {
            Self::CHAT_MESSAGE => serde_json::from_value(raw.payload)
                .map(Self::ChatMessage)
                .map_err(|source| DecodeError::InvalidPayload {
                    kind: Self::CHAT_MESSAGE,
                    source,
                }),
            // payload is ignored
            Self::GET_ONLINE_USERS => Ok(Self::GetOnlineUsers),
            Self::ONLINE_USERS => serde_json::from_value(raw.payload)
                .map(Self::OnlineUsers)
                .map_err(|source| DecodeError::InvalidPayload {
                    kind: Self::ONLINE_USERS,
                    source,
                }),
            _ => Err(DecodeError::UnknownType(raw.kind)),
        }
    }

    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}

/// Handle one inbound text frame from `identity`'s connection.
///
/// `get_online_users` triggers a presence broadcast to every client.
/// `chat_message` is re-stamped with the sender's nickname and the server
/// clock, then fanned out to every client regardless of its receiver.
pub fn handle_text_message(text: &str, hub: &HubHandle, identity: &Identity) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(DecodeError::UnknownType(kind)) => {
            tracing::debug!(
                user_id = identity.user_id,
                kind = %kind,
                "Dropping frame with unknown envelope type"
            );
            return;
        }
        Err(e) => {
            tracing::warn!(
                user_id = identity.user_id,
                error = %e,
                "Failed to decode envelope"
            );
            return;
        }
    };

    match envelope {
        Envelope::GetOnlineUsers => hub.broadcast_presence(),
        Envelope::ChatMessage(message) => {
            match ChatMessage::new(&identity.nickname, &message.receiver, &message.content) {
                Some(stamped) => hub.broadcast_envelope(&Envelope::ChatMessage(stamped)),
                None => tracing::debug!(
                    user_id = identity.user_id,
                    "Dropping blank or oversized chat message"
                ),
            }
        }
        // Presence is computed by the hub; client-made snapshots are not relayed
        Envelope::OnlineUsers(_) => tracing::debug!(
            user_id = identity.user_id,
            "Ignoring client-sent online_users"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_wire_shape() {
        let envelope = Envelope::ChatMessage(ChatMessage {
            sender: "ada".to_string(),
            receiver: "2".to_string(),
            content: "hi".to_string(),
            timestamp: "2024-01-01T00:00:00+00:00".to_string(),
        });
        let value: serde_json::Value =
            serde_json::from_str(envelope.encode().unwrap().as_str()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "chat_message",
                "payload": {
                    "sender": "ada",
                    "receiver": "2",
                    "content": "hi",
                    "timestamp": "2024-01-01T00:00:00+00:00"
                }
            })
        );
    }

    #[test]
    fn test_online_users_wire_shape() {
        let envelope = Envelope::OnlineUsers(vec![OnlineUser {
            id: 7,
            nickname: "grace".to_string(),
        }]);
        let value: serde_json::Value =
            serde_json::from_str(envelope.encode().unwrap().as_str()).unwrap();
        assert_eq!(
            value,
            json!({"type": "online_users", "payload": [{"id": 7, "nickname": "grace"}]})
        );
    }

    #[test]
    fn test_get_online_users_ignores_payload() {
        for text in [
            r#"{"type":"get_online_users"}"#,
            r#"{"type":"get_online_users","payload":null}"#,
            r#"{"type":"get_online_users","payload":{"junk":1}}"#,
        ] {
            assert_eq!(Envelope::decode(text).unwrap(), Envelope::GetOnlineUsers);
        }
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        let err = Envelope::decode(r#"{"type":"typing","payload":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(kind) if kind == "typing"));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"payload":{}}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"chat_message","payload":{"content":1}}"#),
            Err(DecodeError::InvalidPayload { kind: "chat_message", .. })
        ));
    }

    #[test]
    fn test_client_chat_message_may_omit_server_fields() {
        let envelope =
            Envelope::decode(r#"{"type":"chat_message","payload":{"receiver":"2","content":"yo"}}"#)
                .unwrap();
        match envelope {
            Envelope::ChatMessage(message) => {
                assert_eq!(message.receiver, "2");
                assert!(message.sender.is_empty());
                assert!(message.timestamp.is_empty());
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_chat_message_is_trimmed_and_stamped() {
        let message = ChatMessage::new("ada", "", "  hello  ").unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.receiver, BROADCAST_RECEIVER);
        assert!(chrono::DateTime::parse_from_rfc3339(&message.timestamp).is_ok());
    }

    #[test]
    fn test_blank_and_oversized_content_rejected() {
        assert!(ChatMessage::new("ada", "2", "   \n").is_none());
        let long = "x".repeat(MAX_CHAT_LENGTH + 1);
        assert!(ChatMessage::new("ada", "2", &long).is_none());
    }
}
