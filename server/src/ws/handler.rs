use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::HeaderMap,
    response::Response,
};

use crate::auth::session::resolve_identity;
use crate::db::blocking;
use crate::db::models::Identity;
use crate::state::AppState;
use crate::ws::actor;

/// GET /ws
/// WebSocket upgrade endpoint. Authenticates via the `session_id` cookie.
/// Requests without a valid session are never rejected; they are served
/// as read-only guests under a fresh negative identity.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let session = resolve_identity(&headers, state.stores.sessions.clone()).await;
    let (identity, display_name) = match session {
        Some(identity) => (identity, display_name(&state, identity).await),
        None => (state.hub.allocate_guest_identity(), String::new()),
    };

    tracing::info!(
        identity,
        authenticated = identity > 0,
        "WebSocket connection accepted"
    );

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| actor::run_connection(socket, hub, identity, display_name))
}

/// Username shown in presence events. Empty when the user row cannot be read.
async fn display_name(state: &AppState, identity: Identity) -> String {
    let users = state.stores.users.clone();
    match blocking(move || users.user_by_id(identity)).await {
        Ok(Some(user)) => user.username,
        Ok(None) => String::new(),
        Err(e) => {
            tracing::warn!(identity, error = %e, "Failed to load display name");
            String::new()
        }
    }
}
