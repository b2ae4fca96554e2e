//! Shared application state: stores, hub, fan-out, and token keys,
//! constructed once at startup and cloned into every handler.
//!
//! Construction order matters: the hub queue exists first so the fan-out
//! can hold a sending handle, then the hub loop starts with the fan-out
//! it publishes presence changes through.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::TokenKeys;
use relay_store::{
    MessageStore, PresenceStore, RateLimiter, RedisHandle, RevocationStore,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::websocket::fanout::Fanout;
use crate::websocket::hub::{Hub, HubHandle};

/// Everything a request handler needs. Cheap to clone; all heavy parts
/// are behind `Arc`s or pools.
#[derive(Clone)]
pub struct AppState {
    /// Sending side of the hub command queue.
    pub hub: HubHandle,
    /// Frame distribution, local and cross-instance.
    pub fanout: Arc<Fanout>,
    /// Online/offline flags.
    pub presence: Arc<PresenceStore>,
    /// Blacklisted session tokens.
    pub revocation: Arc<RevocationStore>,
    /// Token-bucket rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// Direct-message persistence.
    pub messages: MessageStore,
    /// Session token keys.
    pub keys: Arc<TokenKeys>,
    /// Prometheus render handle; `None` in tests that skip the recorder.
    pub metrics: Option<PrometheusHandle>,
    /// Whether the shared redis backend is attached.
    pub redis_connected: bool,
}

/// Wire up every store and background task from the configuration.
///
/// An unreachable redis is not fatal: the server starts degraded
/// (single-instance, in-memory stores) and says so in the logs.
pub async fn build_state(
    config: &Config,
    metrics: Option<PrometheusHandle>,
) -> anyhow::Result<AppState> {
    let redis = match &config.redis_url {
        Some(url) => match RedisHandle::connect(url).await {
            Ok(handle) => {
                info!("redis connected");
                Some(handle)
            }
            Err(err) => {
                warn!(%err, "redis unreachable, running degraded single-instance");
                None
            }
        },
        None => {
            info!("no redis configured, running single-instance");
            None
        }
    };
    let redis_connected = redis.is_some();

    let presence = Arc::new(PresenceStore::new(redis.clone()));
    let revocation = Arc::new(RevocationStore::new(redis.clone()));
    let limiter = Arc::new(RateLimiter::new(redis.clone()));
    let messages = MessageStore::open(&config.db_path)
        .with_context(|| format!("opening message store at {}", config.db_path.display()))?;
    let keys = Arc::new(TokenKeys::from_secret(config.jwt_secret.as_bytes()));

    let (hub, commands) = HubHandle::channel();
    let fanout = Fanout::new(redis, hub.clone());
    let _ = Hub::spawn(commands, Arc::clone(&presence), Arc::clone(&fanout));
    let _ = fanout.spawn_subscriber();

    Ok(AppState {
        hub,
        fanout,
        presence,
        revocation,
        limiter,
        messages,
        keys,
        metrics,
        redis_connected,
    })
}
