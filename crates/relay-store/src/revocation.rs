//! Token revocation store with a fallback-aware dual backend.
//!
//! Blacklisting a token makes `is_revoked` report it for the record's TTL
//! (which the caller sizes to the token's remaining validity). The primary
//! backend is redis so revocation is visible to every instance; on any
//! primary error both operations transparently use the in-memory map with
//! the same TTL semantics — revocation then only binds this instance,
//! which is the accepted degradation.
//!
//! The store is constructed once at startup and injected; there is no
//! ambient singleton.

use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{RedisHandle, PREFIX_TOKEN_BLACKLIST};
use crate::ttl_map::{spawn_sweeper, TtlMap};

/// How often the fallback map is swept in pure-fallback mode.
const SWEEP_PERIOD: Duration = Duration::from_secs(600);

/// Set of revoked session tokens with expiry.
pub struct RevocationStore {
    redis: Option<RedisHandle>,
    fallback: Arc<TtlMap>,
    sweeper: Option<JoinHandle<()>>,
}

impl RevocationStore {
    /// Build the store. With no redis handle the store runs purely in
    /// memory and starts the background sweeper to bound growth.
    pub fn new(redis: Option<RedisHandle>) -> Self {
        let fallback = Arc::new(TtlMap::new());
        let sweeper = if redis.is_none() {
            info!("token revocation using in-memory fallback");
            Some(spawn_sweeper(Arc::clone(&fallback), SWEEP_PERIOD))
        } else {
            info!("token revocation using redis");
            None
        };
        Self {
            redis,
            fallback,
            sweeper,
        }
    }

    /// Revoke `token` for `ttl`. Never fails: a primary-backend error
    /// downgrades to the in-memory map.
    pub async fn blacklist(&self, token: &str, ttl: Duration) {
        if let Some(redis) = &self.redis {
            let key = format!("{PREFIX_TOKEN_BLACKLIST}{token}");
            let mut conn = redis.connection();
            let result: redis::RedisResult<()> =
                conn.set_ex(&key, "1", ttl.as_secs().max(1)).await;
            match result {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "redis blacklist write failed, using in-memory fallback");
                }
            }
        }
        self.fallback.insert(token, ttl);
    }

    /// Whether `token` is currently revoked. A record past its expiry is
    /// treated as absent on both backends.
    pub async fn is_revoked(&self, token: &str) -> bool {
        if let Some(redis) = &self.redis {
            let key = format!("{PREFIX_TOKEN_BLACKLIST}{token}");
            let mut conn = redis.connection();
            let result: redis::RedisResult<bool> = conn.exists(&key).await;
            match result {
                Ok(revoked) => return revoked || self.fallback.contains(token),
                Err(e) => {
                    warn!(error = %e, "redis blacklist check failed, using in-memory fallback");
                }
            }
        }
        self.fallback.contains(token)
    }
}

impl Drop for RevocationStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
