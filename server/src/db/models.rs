//! Row and payload types shared by the stores, the REST handlers and the
//! wire protocol.

use serde::{Deserialize, Serialize};

/// Integer key of a connection owner: positive for authenticated users
/// (the `users.id` column), negative for ephemeral guests.
pub type Identity = i64;

/// The part of a user record the hub needs; also the `GET /api/me` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Identity,
    pub username: String,
}

/// Result of persisting a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    /// RFC 3339, UTC, second precision.
    pub created_at: String,
}

/// A persisted private message, as sent over the wire and returned by the
/// history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub from: Identity,
    pub to: Identity,
    pub content: String,
    pub created_at: String,
}

/// Entry of the chat roster returned by `GET /api/users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatUser {
    pub id: Identity,
    pub username: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<String>,
}

/// Forum post as embedded in `post_created` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub user_id: Identity,
    pub username: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub likes: i64,
    pub dislikes: i64,
    pub comment_count: i64,
    pub created_at: String,
}

/// Comment as embedded in `comment_created` / `comment_reaction` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub user_id: Identity,
    pub username: String,
    pub content: String,
    pub likes: i64,
    pub dislikes: i64,
    pub created_at: String,
}
