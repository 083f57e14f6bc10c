//! Account endpoints that act on the caller's own session.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::session::{session_id, SessionUser, SESSION_COOKIE};
use crate::db::blocking;
use crate::db::models::UserSummary;
use crate::state::AppState;

/// POST /api/logout
/// Deletes the session row, closes every live connection of its owner and
/// clears the cookie. Always 204; a missing or unknown session is already
/// logged out.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(sid) = session_id(&headers) {
        let sessions = state.stores.sessions.clone();
        match blocking(move || sessions.delete_session(&sid)).await {
            Ok(Some(identity)) => {
                tracing::info!(identity, "User logged out");
                state.hub.force_disconnect(identity);
            }
            Ok(None) => tracing::debug!("Logout with unknown session"),
            Err(e) => tracing::warn!(error = %e, "Failed to delete session"),
        }
    }

    let expired = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly");
    (StatusCode::NO_CONTENT, [(header::SET_COOKIE, expired)]).into_response()
}

/// GET /api/me
pub async fn me(
    State(state): State<AppState>,
    SessionUser(me): SessionUser,
) -> Result<Json<UserSummary>, StatusCode> {
    let users = state.stores.users.clone();
    match blocking(move || users.user_by_id(me)).await {
        Ok(Some(user)) => Ok(Json(user)),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(e) => {
            tracing::warn!(identity = me, error = %e, "Failed to load current user");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
