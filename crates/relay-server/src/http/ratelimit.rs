//! Rate-limit middleware for HTTP routes.
//!
//! Each request is attributed to a subject: the authenticated user when
//! a valid bearer token is present, otherwise the client IP (first
//! `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer). The
//! subject's bucket is checked against the route group's preset; a
//! denial is a 429 with `Retry-After`, and every response carries
//! `X-RateLimit-Limit`/`-Remaining`/`-Reset` headers.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use relay_store::{RateDecision, RateLimitConfig};
use std::net::SocketAddr;
use tracing::debug;

use crate::metrics::HTTP_RATE_LIMITED_TOTAL;
use crate::state::AppState;

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The middleware entry point; paired with a preset per route group.
pub async fn enforce(
    State((state, config)): State<(AppState, RateLimitConfig)>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let subject = subject_for(&state, request.headers(), peer);
    let decision = state.limiter.check(&subject, config).await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        counter!(HTTP_RATE_LIMITED_TOTAL).increment(1);
        debug!(subject, "http request rate limited");
        let mut denied =
            (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
        let _ = denied.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after.as_secs()),
        );
        denied
    };
    annotate(&mut response, config, decision);
    response
}

fn annotate(response: &mut Response, config: RateLimitConfig, decision: RateDecision) {
    let headers = response.headers_mut();
    let _ = headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(config.limit));
    let _ = headers.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining),
    );
    let _ = headers.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(decision.retry_after.as_secs()),
    );
}

/// The bucket subject for one request.
///
/// A valid bearer token pins the subject to the user so NAT'd clients
/// get independent budgets; everything else falls back to the best
/// available client IP.
fn subject_for(state: &AppState, headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(user) = bearer_user(state, headers) {
        return format!("user:{user}");
    }
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
        {
            return format!("ip:{first}");
        }
    }
    if let Some(real) = header_str(headers, "x-real-ip") {
        let real = real.trim();
        if !real.is_empty() {
            return format!("ip:{real}");
        }
    }
    format!("ip:{}", peer.ip())
}

fn bearer_user(state: &AppState, headers: &HeaderMap) -> Option<relay_core::UserId> {
    let token = header_str(headers, "authorization")?.strip_prefix("Bearer ")?;
    state.keys.validate_token(token).ok().map(|user| user.id)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}
