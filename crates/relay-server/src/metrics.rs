//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Routed WebSocket messages total (counter).
pub const WS_MESSAGES_TOTAL: &str = "ws_messages_total";
/// Frames dropped because a mailbox was full (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Rate-limited WebSocket frames total (counter).
pub const WS_RATE_LIMITED_TOTAL: &str = "ws_rate_limited_total";
/// Fan-out publish failures total (counter).
pub const FANOUT_PUBLISH_ERRORS_TOTAL: &str = "fanout_publish_errors_total";
/// HTTP requests refused with 429 total (counter).
pub const HTTP_RATE_LIMITED_TOTAL: &str = "http_requests_rate_limited_total";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prometheus_safe() {
        for name in [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_MESSAGES_TOTAL,
            WS_BROADCAST_DROPS_TOTAL,
            WS_RATE_LIMITED_TOTAL,
            FANOUT_PUBLISH_ERRORS_TOTAL,
            HTTP_RATE_LIMITED_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
        ] {
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        }
    }
}
