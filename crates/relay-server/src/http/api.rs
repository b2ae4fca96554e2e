//! REST handlers: health, metrics, logout, presence listing, and
//! direct-message history.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::{AuthUser, UserId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

/// Default and maximum page size for conversation history.
const HISTORY_DEFAULT_LIMIT: u32 = 50;
const HISTORY_MAX_LIMIT: u32 = 200;

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "redis_connected": state.redis_connected,
    }))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `POST /api/logout` — blacklist the presented token for the rest of
/// its validity.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (token, user) = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    if let Some(ttl) = state.keys.remaining_validity(&token) {
        state.revocation.blacklist(&token, ttl).await;
    }
    info!(user = %user.id, "user logged out");
    Json(json!({"status": "logged_out"})).into_response()
}

#[derive(Debug, Serialize)]
struct OnlineResponse {
    user_ids: Vec<i64>,
}

/// `GET /api/online` — ids of every currently-online user.
pub async fn online_users(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers).await {
        return response;
    }
    let user_ids = state
        .presence
        .online_users()
        .await
        .into_iter()
        .map(|user| user.0)
        .collect();
    Json(OnlineResponse { user_ids }).into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<u32>,
}

/// `GET /api/messages/{peer}` — recent conversation between the caller
/// and `peer`, oldest first.
pub async fn conversation(
    State(state): State<AppState>,
    Path(peer): Path<i64>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Response {
    let (_, user) = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    if peer <= 0 {
        return (StatusCode::BAD_REQUEST, "invalid peer id").into_response();
    }
    let limit = query
        .limit
        .unwrap_or(HISTORY_DEFAULT_LIMIT)
        .clamp(1, HISTORY_MAX_LIMIT);

    let store = state.messages.clone();
    let caller = user.id;
    let result =
        tokio::task::spawn_blocking(move || store.conversation(caller, UserId(peer), limit)).await;
    match result {
        Ok(Ok(messages)) => Json(messages).into_response(),
        Ok(Err(err)) => {
            warn!(%err, "conversation read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response()
        }
        Err(err) => {
            warn!(%err, "conversation task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response()
        }
    }
}

/// Shared bearer-token gate: presence, revocation, then validity.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(String, AuthUser), Response> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing token").into_response())?;
    if state.revocation.is_revoked(token).await {
        return Err((StatusCode::UNAUTHORIZED, "token revoked").into_response());
    }
    let user = state
        .keys
        .validate_token(token)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "invalid token").into_response())?;
    Ok((token.to_string(), user))
}
