//! JSON wire format of the `/ws` endpoint.
//!
//! Every frame is a JSON object carrying a `type` discriminator. Outbound
//! frames are [`WireEvent`]s; the only inbound command is a private message.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::{ChatMessage, Comment, Identity, Post};
use crate::hub::{OnlineUser, PresenceStatus};
use crate::ws::protocol::ProtocolError;

/// Upper bound on a private message body, in characters.
pub const MAX_CONTENT_LENGTH: usize = 4000;

/// Server -> client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Init {
        user_id: Identity,
        online_users: Vec<OnlineUser>,
    },
    Presence {
        user_id: Identity,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },
    Message(ChatMessage),
    Error {
        message: String,
    },
    PostCreated {
        post: Post,
    },
    CommentCreated {
        post_id: i64,
        comment_count: i64,
        comment: Comment,
    },
    PostReaction {
        post_id: i64,
        likes: i64,
        dislikes: i64,
    },
    CommentReaction {
        post_id: i64,
        comment_id: i64,
        likes: i64,
        dislikes: i64,
        comment: Comment,
    },
    UserCreated {
        user_id: Identity,
        username: String,
    },
}

impl WireEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Presence { .. } => "presence",
            Self::Message(_) => "message",
            Self::Error { .. } => "error",
            Self::PostCreated { .. } => "post_created",
            Self::CommentCreated { .. } => "comment_created",
            Self::PostReaction { .. } => "post_reaction",
            Self::CommentReaction { .. } => "comment_reaction",
            Self::UserCreated { .. } => "user_created",
        }
    }

    /// Serialize into a text frame. Serialization of these types cannot
    /// realistically fail; if it does, the event is logged and skipped.
    pub fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                tracing::error!(event = self.kind(), error = %e, "Failed to encode event");
                None
            }
        }
    }
}

/// Client -> server command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Message { to: Identity, content: String },
}

/// Decode one inbound text frame.
///
/// `to` is accepted as a JSON number or a numeric string. Content must be
/// non-empty after trimming and at most [`MAX_CONTENT_LENGTH`] characters.
pub fn decode_command(text: &str) -> Result<Command, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;
    let Value::Object(fields) = value else {
        return Err(ProtocolError::Malformed);
    };

    match fields.get("type").and_then(Value::as_str) {
        Some("message") => {
            let to = fields.get("to").and_then(parse_identity);
            let content = fields.get("content").and_then(Value::as_str);
            match (to, content) {
                (Some(to), Some(content)) if to > 0 && !content.trim().is_empty() => {
                    if content.chars().count() > MAX_CONTENT_LENGTH {
                        return Err(ProtocolError::TooLong);
                    }
                    Ok(Command::Message {
                        to,
                        content: content.to_string(),
                    })
                }
                _ => Err(ProtocolError::InvalidPayload),
            }
        }
        Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
        None => Err(ProtocolError::UnknownType(String::new())),
    }
}

fn parse_identity(value: &Value) -> Option<Identity> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_json(event: &WireEvent) -> Value {
        serde_json::to_value(event).unwrap()
    }

    #[test]
    fn test_init_shape() {
        let event = WireEvent::Init {
            user_id: -3,
            online_users: vec![OnlineUser {
                user_id: 1,
                nickname: "alice".to_string(),
            }],
        };
        assert_eq!(
            to_json(&event),
            json!({
                "type": "init",
                "user_id": -3,
                "online_users": [{"user_id": 1, "nickname": "alice"}]
            })
        );
    }

    #[test]
    fn test_presence_nickname_is_optional() {
        let with = WireEvent::Presence {
            user_id: 2,
            status: PresenceStatus::Online,
            nickname: Some("bob".to_string()),
        };
        assert_eq!(
            to_json(&with),
            json!({"type": "presence", "user_id": 2, "status": "online", "nickname": "bob"})
        );

        let without = WireEvent::Presence {
            user_id: 2,
            status: PresenceStatus::Offline,
            nickname: None,
        };
        assert_eq!(
            to_json(&without),
            json!({"type": "presence", "user_id": 2, "status": "offline"})
        );
    }

    #[test]
    fn test_message_fields_are_flattened() {
        let event = WireEvent::Message(ChatMessage {
            id: 11,
            from: 1,
            to: 2,
            content: "hi".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        });
        assert_eq!(
            to_json(&event),
            json!({
                "type": "message",
                "id": 11,
                "from": 1,
                "to": 2,
                "content": "hi",
                "created_at": "2024-01-01T00:00:00Z"
            })
        );
        assert_eq!(event.kind(), "message");
    }

    #[test]
    fn test_reaction_shapes() {
        assert_eq!(
            to_json(&WireEvent::PostReaction {
                post_id: 5,
                likes: 3,
                dislikes: 1
            }),
            json!({"type": "post_reaction", "post_id": 5, "likes": 3, "dislikes": 1})
        );
        assert_eq!(
            to_json(&WireEvent::UserCreated {
                user_id: 8,
                username: "eve".to_string()
            }),
            json!({"type": "user_created", "user_id": 8, "username": "eve"})
        );
    }

    #[test]
    fn test_decode_accepts_numeric_and_string_recipient() {
        let expected = Command::Message {
            to: 42,
            content: "hello".to_string(),
        };
        assert_eq!(
            decode_command(r#"{"type":"message","to":42,"content":"hello"}"#).unwrap(),
            expected
        );
        assert_eq!(
            decode_command(r#"{"type":"message","to":"42","content":"hello"}"#).unwrap(),
            expected
        );
        assert_eq!(
            decode_command(r#"{"type":"message","to":42.0,"content":"hello"}"#).unwrap(),
            expected
        );
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        for text in [
            r#"{"type":"message","to":42,"content":"   "}"#,
            r#"{"type":"message","to":42}"#,
            r#"{"type":"message","to":"abc","content":"x"}"#,
            r#"{"type":"message","to":-1,"content":"x"}"#,
            r#"{"type":"message","to":1.5,"content":"x"}"#,
            r#"{"type":"message","to":true,"content":"x"}"#,
        ] {
            assert!(
                matches!(decode_command(text), Err(ProtocolError::InvalidPayload)),
                "{text}"
            );
        }
    }

    #[test]
    fn test_decode_classifies_other_failures() {
        assert!(matches!(
            decode_command("not json"),
            Err(ProtocolError::Malformed)
        ));
        assert!(matches!(decode_command("[1,2]"), Err(ProtocolError::Malformed)));
        assert!(matches!(
            decode_command(r#"{"type":"typing"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "typing"
        ));
        assert!(matches!(
            decode_command(r#"{"to":1,"content":"x"}"#),
            Err(ProtocolError::UnknownType(_))
        ));

        let long = "a".repeat(MAX_CONTENT_LENGTH + 1);
        let text = json!({"type": "message", "to": 1, "content": long}).to_string();
        assert!(matches!(decode_command(&text), Err(ProtocolError::TooLong)));
    }
}
