//! REST endpoints clients use alongside the hub: private message history
//! and the chat roster.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::session::SessionUser;
use crate::db::blocking;
use crate::db::models::{ChatMessage, ChatUser, Identity};
use crate::state::AppState;

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: Option<String>,
    pub offset: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
}

fn internal(context: &'static str) -> impl Fn(crate::db::StoreError) -> ApiError {
    move |e| {
        tracing::warn!(error = %e, "{context}");
        (StatusCode::INTERNAL_SERVER_ERROR, context.to_string())
    }
}

/// GET /api/messages?user_id=<id>&offset=<n>
/// One page of the conversation between the caller and `user_id`, newest
/// first. An unparseable offset counts as 0.
pub async fn get_messages(
    State(state): State<AppState>,
    SessionUser(me): SessionUser,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let other: Identity = match params.user_id.as_deref().map(str::trim) {
        None | Some("") => return Err((StatusCode::BAD_REQUEST, "missing user_id".to_string())),
        Some(raw) => raw
            .parse()
            .map_err(|_| (StatusCode::BAD_REQUEST, "invalid user_id".to_string()))?,
    };
    let offset: u32 = params
        .offset
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .map(|n| n.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or(0);
    let limit = state.history_page_size;

    let users = state.stores.users.clone();
    let peer = blocking(move || users.user_by_id(other))
        .await
        .map_err(internal("failed to load user"))?;
    if peer.is_none() {
        return Err((StatusCode::NOT_FOUND, "user not found".to_string()));
    }

    let store = state.stores.messages.clone();
    let (messages, total) = blocking(move || {
        let page = store.messages_between(me, other, offset, limit)?;
        let total = store.count_between(me, other)?;
        Ok((page, total))
    })
    .await
    .map_err(internal("failed to load messages"))?;

    let has_more = u64::from(offset) + u64::from(limit) < total;
    Ok(Json(HistoryResponse { messages, has_more }))
}

/// GET /api/users
/// Every other user with their persisted presence and the time of the last
/// message exchanged with the caller.
pub async fn list_chat_users(
    State(state): State<AppState>,
    SessionUser(me): SessionUser,
) -> Result<Json<Vec<ChatUser>>, ApiError> {
    let roster = state.stores.roster.clone();
    let users = blocking(move || roster.chat_users(me))
        .await
        .map_err(internal("failed to load users"))?;
    Ok(Json(users))
}
