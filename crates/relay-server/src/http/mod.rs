//! HTTP surface: router assembly, REST handlers, and the rate-limit
//! middleware.
//!
//! Route groups carry different rate-limit presets: `/api/logout` is
//! sensitive, the read endpoints are generous, and `/ws`, `/healthz`,
//! `/metrics` are unthrottled (`/ws` traffic is throttled per message
//! once connected).

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use relay_store::RateLimitConfig;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::websocket::connection;

pub mod api;
pub mod ratelimit;

/// Assemble the full router.
pub fn build_router(state: AppState) -> Router {
    let sensitive = Router::new()
        .route("/api/logout", post(api::logout))
        .route_layer(middleware::from_fn_with_state(
            (state.clone(), RateLimitConfig::SENSITIVE),
            ratelimit::enforce,
        ));
    let read_only = Router::new()
        .route("/api/online", get(api::online_users))
        .route("/api/messages/{peer}", get(api::conversation))
        .route_layer(middleware::from_fn_with_state(
            (state.clone(), RateLimitConfig::READ_ONLY),
            ratelimit::enforce,
        ));

    Router::new()
        .route("/ws", get(connection::ws_handler))
        .route("/healthz", get(api::healthz))
        .route("/metrics", get(api::metrics))
        .merge(sensitive)
        .merge(read_only)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
