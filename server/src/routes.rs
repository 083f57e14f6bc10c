use axum::Router;

use crate::auth::account;
use crate::chat::history;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes.
pub fn build_router(state: AppState) -> Router {
    // Chat REST surface (session cookie required, checked by SessionUser)
    let chat_routes = Router::new()
        .route("/api/messages", axum::routing::get(history::get_messages))
        .route("/api/users", axum::routing::get(history::list_chat_users));

    // Account surface
    let account_routes = Router::new()
        .route("/api/logout", axum::routing::post(account::logout))
        .route("/api/me", axum::routing::get(account::me));

    // WebSocket endpoint (session cookie optional; guests are served read-only)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(chat_routes)
        .merge(account_routes)
        .merge(ws_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
