//! Per-connection actor: upgrade-time auth plus the read/write pumps.
//!
//! Auth happens before the upgrade completes — a missing, invalid, or
//! revoked token gets a plain 401 and no socket. After the upgrade the
//! socket splits into a read pump (inbound frames: size cap, rate check,
//! sender stamp, routing) and a write pump (drains the hub mailbox,
//! coalescing queued frames into one newline-separated write).
//!
//! The write pump owns the socket's liveness: it pings on a timer and
//! bounds every send with a deadline. The read pump bounds how long the
//! peer may stay silent; any inbound traffic (including pong) resets
//! that clock.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use relay_core::{normalize, AuthUser, ConnectionId, Envelope, InboundFrame, MAX_FRAME_BYTES};
use serde::Deserialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::metrics::{
    WS_CONNECTIONS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_DISCONNECTIONS_TOTAL,
    WS_MESSAGES_TOTAL, WS_RATE_LIMITED_TOTAL,
};
use crate::state::AppState;
use crate::websocket::hub::{ConnectionHandle, Frame};

/// Deadline for any single socket write.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// How long the peer may stay completely silent before the connection
/// is considered dead.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Ping cadence; must leave the peer time to pong inside [`READ_TIMEOUT`].
const PING_PERIOD: Duration = Duration::from_secs(54);

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
}

/// `GET /ws` — authenticate, then upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = extract_token(&headers, &query) else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    if state.revocation.is_revoked(&token).await {
        return (StatusCode::UNAUTHORIZED, "token revoked").into_response();
    }
    let user = match state.keys.validate_token(&token) {
        Ok(user) => user,
        Err(err) => {
            debug!(%err, "websocket upgrade rejected");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };
    ws.on_upgrade(move |socket| run_connection(state, socket, user))
}

/// Token from `?token=` or the `Authorization: Bearer` header, query
/// winning (browsers cannot set headers on a WebSocket upgrade).
fn extract_token(headers: &HeaderMap, query: &WsQuery) -> Option<String> {
    if let Some(token) = &query.token {
        if !token.is_empty() {
            return Some(token.clone());
        }
    }
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn run_connection(state: AppState, socket: WebSocket, user: AuthUser) {
    let id = ConnectionId::new();
    let connected_at = std::time::Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(user = %user.id, username = %user.username, connection = %id, "websocket connected");

    let (handle, mailbox) = ConnectionHandle::channel(id, user.id, &user.username);
    state.hub.register(handle).await;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, mailbox));
    read_pump(&state, stream, &user).await;

    // unregister drops the hub's sender; the write pump sees the mailbox
    // close, sends Close, and exits
    state.hub.unregister(id).await;
    let _ = writer.await;

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connected_at.elapsed().as_secs_f64());
    info!(user = %user.id, connection = %id, "websocket disconnected");
}

/// Drain the mailbox onto the socket. Queued frames are coalesced into
/// one newline-separated write; a closed mailbox means the hub dropped
/// us and the socket gets a Close frame.
async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut mailbox: mpsc::Receiver<Frame>) {
    let start = tokio::time::Instant::now() + PING_PERIOD;
    let mut ping = tokio::time::interval_at(start, PING_PERIOD);
    loop {
        tokio::select! {
            frame = mailbox.recv() => {
                let Some(frame) = frame else {
                    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    return;
                };
                let text = coalesce_pending(frame, &mut mailbox);
                match timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(%err, "socket write failed");
                        return;
                    }
                    Err(_) => {
                        warn!("socket write deadline exceeded");
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                if timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new().into())))
                    .await
                    .map_or(true, |sent| sent.is_err())
                {
                    debug!("ping failed, closing write pump");
                    return;
                }
            }
        }
    }
}

/// Join a frame with everything already queued behind it, separated by
/// newlines, so one write drains the backlog.
fn coalesce_pending(first: Frame, mailbox: &mut mpsc::Receiver<Frame>) -> String {
    let mut text = first.to_string();
    while let Ok(next) = mailbox.try_recv() {
        text.push('\n');
        text.push_str(&next);
    }
    text
}

async fn read_pump(state: &AppState, mut stream: SplitStream<WebSocket>, user: &AuthUser) {
    loop {
        let msg = match timeout(READ_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(err))) => {
                debug!(user = %user.id, %err, "socket read failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                debug!(user = %user.id, "read timeout, peer silent too long");
                return;
            }
        };
        let text = match msg {
            Message::Text(text) => text.to_string(),
            // control traffic counts as liveness and nothing more
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return,
            Message::Binary(_) => {
                debug!(user = %user.id, "binary frame ignored");
                continue;
            }
        };
        if handle_frame(state, user, &text).await.is_break() {
            return;
        }
    }
}

/// Process one inbound text frame. `Break` disconnects the sender.
async fn handle_frame(state: &AppState, user: &AuthUser, text: &str) -> ControlFlow<()> {
    if text.len() > MAX_FRAME_BYTES {
        warn!(user = %user.id, bytes = text.len(), "oversized frame, disconnecting");
        return ControlFlow::Break(());
    }
    let normalized = normalize(text);
    if normalized.is_empty() {
        return ControlFlow::Continue(());
    }
    counter!(WS_MESSAGES_TOTAL).increment(1);

    match Envelope::parse(&normalized) {
        InboundFrame::Opaque(raw) => {
            // legacy free-form text keeps flowing through broadcast,
            // never throttled
            state.fanout.broadcast(Arc::from(raw.as_str())).await;
        }
        // heartbeats are liveness, not traffic: no rate check, answered
        // directly, never fanned out
        InboundFrame::Envelope(Envelope::Heartbeat) => {
            state.presence.refresh(user.id).await;
            send_to_self(state, user, &Envelope::HeartbeatAck).await;
        }
        InboundFrame::Envelope(mut envelope) => {
            if !state.limiter.check_user_message(user.id).await {
                counter!(WS_RATE_LIMITED_TOTAL).increment(1);
                debug!(user = %user.id, "message rate limit exceeded");
                send_to_self(state, user, &Envelope::rate_limit_error()).await;
                return ControlFlow::Continue(());
            }
            envelope.stamp_sender(user.id, &user.username);
            persist_if_direct_chat(state, &envelope);
            let frame: Frame = match envelope.encode() {
                Ok(encoded) => Arc::from(encoded.as_str()),
                Err(err) => {
                    warn!(%err, "failed to re-encode inbound envelope");
                    return ControlFlow::Continue(());
                }
            };
            match envelope.recipient() {
                Some(to) => {
                    state.fanout.direct(to, Arc::clone(&frame)).await;
                    // the sender sees their own direct message too
                    state.hub.direct(user.id, frame).await;
                }
                None => state.fanout.broadcast(frame).await,
            }
        }
    }
    ControlFlow::Continue(())
}

/// Save direct chat text off the hot path; a failure is logged, never
/// surfaced to the sender.
fn persist_if_direct_chat(state: &AppState, envelope: &Envelope) {
    let Envelope::Chat {
        from_user_id,
        to_user_id,
        text,
        ..
    } = envelope
    else {
        return;
    };
    if *to_user_id <= 0 || text.is_empty() {
        return;
    }
    let store = state.messages.clone();
    let (from, to, text) = (
        relay_core::UserId(*from_user_id),
        relay_core::UserId(*to_user_id),
        text.clone(),
    );
    let _ = tokio::task::spawn_blocking(move || {
        if let Err(err) = store.save_direct_message(from, to, &text) {
            warn!(%err, "direct message persistence failed");
        }
    });
}

async fn send_to_self(state: &AppState, user: &AuthUser, envelope: &Envelope) {
    match envelope.encode() {
        Ok(encoded) => state.hub.direct(user.id, Arc::from(encoded.as_str())).await,
        Err(err) => warn!(%err, "failed to encode server frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn headers_with(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(AUTHORIZATION, auth.parse().unwrap());
        headers
    }

    #[test]
    fn query_token_wins_over_header() {
        let query = WsQuery {
            token: Some("from-query".into()),
        };
        let headers = headers_with("Bearer from-header");
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("from-query"));
    }

    #[test]
    fn bearer_header_is_a_fallback() {
        let query = WsQuery { token: None };
        let headers = headers_with("Bearer tok123");
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("tok123"));
    }

    #[test]
    fn empty_query_token_is_ignored() {
        let query = WsQuery {
            token: Some(String::new()),
        };
        let headers = headers_with("Bearer tok123");
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("tok123"));
    }

    #[test]
    fn non_bearer_auth_is_rejected() {
        let query = WsQuery { token: None };
        let headers = headers_with("Basic dXNlcjpwdw==");
        assert_eq!(extract_token(&headers, &query), None);
    }

    #[test]
    fn missing_credentials_yield_none() {
        let query = WsQuery { token: None };
        assert_eq!(extract_token(&HeaderMap::new(), &query), None);
    }

    #[tokio::test]
    async fn queued_frames_coalesce_into_one_newline_joined_write() {
        let (tx, mut rx) = mpsc::channel::<Frame>(8);
        for frame in ["first", "second", "third"] {
            tx.try_send(Arc::from(frame)).unwrap();
        }
        let first = rx.recv().await.unwrap();
        assert_eq!(coalesce_pending(first, &mut rx), "first\nsecond\nthird");
        assert!(rx.try_recv().is_err(), "coalescing must drain the queue");
    }

    #[tokio::test]
    async fn a_lone_frame_is_written_as_is() {
        let (tx, mut rx) = mpsc::channel::<Frame>(8);
        tx.try_send(Arc::from("only")).unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(coalesce_pending(first, &mut rx), "only");
    }
}
