//! Cookie-session resolution for both the REST handlers and the WebSocket
//! upgrade. Sessions are rows in the `sessions` table keyed by the value of
//! the `session_id` cookie.

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, StatusCode},
};

use crate::db::blocking;
use crate::db::models::Identity;
use crate::db::SessionStore;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "session_id";

/// Find `name` in a `Cookie` header value.
pub fn parse_cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        let value = value.trim().trim_matches('"');
        (key.trim() == name && !value.is_empty()).then_some(value)
    })
}

/// The session id carried by a request, if any.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookies| parse_cookie_value(cookies, SESSION_COOKIE))
        .map(str::to_string)
}

/// Resolve the authenticated identity behind a request. Missing, unknown
/// and expired sessions all resolve to `None`; so do store failures, which
/// are logged.
pub async fn resolve_identity(
    headers: &HeaderMap,
    sessions: Arc<dyn SessionStore>,
) -> Option<Identity> {
    let sid = session_id(headers)?;
    match blocking(move || sessions.user_for_session(&sid)).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(error = %e, "Session lookup failed");
            None
        }
    }
}

/// Authenticated caller of a REST endpoint. Rejects with 401 when the
/// request carries no valid session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionUser(pub Identity);

impl FromRequestParts<AppState> for SessionUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        resolve_identity(&parts.headers, state.stores.sessions.clone())
            .await
            .map(SessionUser)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}
