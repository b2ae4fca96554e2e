//! Presence store: per-user online flags with a heartbeat-refreshed TTL.
//!
//! A user is online while their flag key lives; the flag is created on
//! register, refreshed on every application heartbeat, and deleted on
//! unregister. The TTL covers abrupt disconnects where unregister never
//! fires. Same dual-backend contract as the revocation store.

use redis::AsyncCommands;
use relay_core::UserId;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::{RedisHandle, KEY_ONLINE_USERS, PREFIX_USER_ONLINE};
use crate::ttl_map::TtlMap;

/// Online flag lifetime; heartbeats arrive well inside this window.
pub const ONLINE_TTL: Duration = Duration::from_secs(30);

/// Mapping from user id to online flag with auto-expiring heartbeat.
pub struct PresenceStore {
    redis: Option<RedisHandle>,
    fallback: Arc<TtlMap>,
    ttl: Duration,
}

impl PresenceStore {
    /// Build the store; `None` runs purely in memory.
    pub fn new(redis: Option<RedisHandle>) -> Self {
        Self::with_ttl(redis, ONLINE_TTL)
    }

    /// Build with a custom TTL (tests).
    pub fn with_ttl(redis: Option<RedisHandle>, ttl: Duration) -> Self {
        Self {
            redis,
            fallback: Arc::new(TtlMap::new()),
            ttl,
        }
    }

    fn flag_key(user: UserId) -> String {
        format!("{PREFIX_USER_ONLINE}{user}")
    }

    /// Mark `user` online. Called by the hub on register.
    pub async fn set_online(&self, user: UserId) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.connection();
            let result: redis::RedisResult<()> = async {
                let _: i64 = conn.sadd(KEY_ONLINE_USERS, user.0).await?;
                conn.set_ex(Self::flag_key(user), "1", self.ttl.as_secs())
                    .await
            }
            .await;
            match result {
                Ok(()) => return,
                Err(e) => warn!(error = %e, %user, "redis set_online failed, using fallback"),
            }
        }
        self.fallback.insert(&user.to_string(), self.ttl);
    }

    /// Mark `user` offline. Called by the hub on unregister.
    pub async fn set_offline(&self, user: UserId) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.connection();
            let result: redis::RedisResult<()> = async {
                let _: i64 = conn.srem(KEY_ONLINE_USERS, user.0).await?;
                let _: i64 = conn.del(Self::flag_key(user)).await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => {}
                Err(e) => warn!(error = %e, %user, "redis set_offline failed"),
            }
        }
        self.fallback.remove(&user.to_string());
    }

    /// Refresh the online TTL. Called on every application heartbeat.
    pub async fn refresh(&self, user: UserId) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.connection();
            let result: redis::RedisResult<bool> =
                conn.expire(Self::flag_key(user), self.ttl.as_secs() as i64).await;
            match result {
                Ok(_) => return,
                Err(e) => warn!(error = %e, %user, "redis presence refresh failed, using fallback"),
            }
        }
        self.fallback.insert(&user.to_string(), self.ttl);
    }

    /// Whether `user` is currently online.
    pub async fn is_online(&self, user: UserId) -> bool {
        if let Some(redis) = &self.redis {
            let mut conn = redis.connection();
            let result: redis::RedisResult<bool> =
                conn.sismember(KEY_ONLINE_USERS, user.0).await;
            match result {
                Ok(online) => return online,
                Err(e) => warn!(error = %e, %user, "redis is_online failed, using fallback"),
            }
        }
        self.fallback.contains(&user.to_string())
    }

    /// Ids of every currently-online user.
    pub async fn online_users(&self) -> Vec<UserId> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.connection();
            let result: redis::RedisResult<Vec<i64>> = conn.smembers(KEY_ONLINE_USERS).await;
            match result {
                Ok(ids) => return ids.into_iter().map(UserId).collect(),
                Err(e) => warn!(error = %e, "redis online_users failed, using fallback"),
            }
        }
        let mut ids: Vec<UserId> = self
            .fallback
            .live_keys()
            .into_iter()
            .filter_map(|key| key.parse::<i64>().ok().map(UserId))
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn online_until_ttl_expires() {
        let store = PresenceStore::new(None);
        store.set_online(UserId(1)).await;
        assert!(store.is_online(UserId(1)).await);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!store.is_online(UserId(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_refresh_keeps_user_online() {
        let store = PresenceStore::new(None);
        store.set_online(UserId(1)).await;
        tokio::time::advance(Duration::from_secs(25)).await;
        store.refresh(UserId(1)).await;
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(store.is_online(UserId(1)).await);
    }

    #[tokio::test]
    async fn set_offline_is_immediate() {
        let store = PresenceStore::new(None);
        store.set_online(UserId(3)).await;
        store.set_offline(UserId(3)).await;
        assert!(!store.is_online(UserId(3)).await);
    }

    #[tokio::test]
    async fn online_users_lists_everyone_online() {
        let store = PresenceStore::new(None);
        store.set_online(UserId(2)).await;
        store.set_online(UserId(1)).await;
        store.set_offline(UserId(2)).await;
        assert_eq!(store.online_users().await, vec![UserId(1)]);
    }
}
