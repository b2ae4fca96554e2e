//! Shared redis connection handle and the cache key vocabulary.
//!
//! One [`RedisHandle`] is created at startup and cloned into every store;
//! `ConnectionManager` multiplexes a single reconnecting connection, so
//! clones are cheap. If redis is unreachable at startup the process runs
//! without a handle and every store stays in its in-memory degraded mode.

use redis::aio::ConnectionManager;

/// Revoked-token records: `token:blacklist:<token>` → `"1"` with TTL.
pub const PREFIX_TOKEN_BLACKLIST: &str = "token:blacklist:";
/// Per-user online flag: `user:online:<id>` → `"1"` with TTL.
pub const PREFIX_USER_ONLINE: &str = "user:online:";
/// Set of currently-online user ids.
pub const KEY_ONLINE_USERS: &str = "online:users";
/// Rate-limit windows: `ratelimit:<subject>:<bucket>` → remaining tokens.
pub const PREFIX_RATELIMIT: &str = "ratelimit:";
/// Cross-instance fan-out pub/sub channel.
pub const CHANNEL_FANOUT: &str = "chat:fanout";

/// Cloneable handle to the shared redis backend.
#[derive(Clone)]
pub struct RedisHandle {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisHandle {
    /// Open a client and establish the managed connection.
    ///
    /// Fails only when redis is unreachable right now; callers treat that
    /// as "run degraded", not as a startup error.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    /// A multiplexed connection for commands. Clone of the shared manager;
    /// reconnects transparently after transient failures.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// The underlying client, needed for dedicated pub/sub connections
    /// (a subscriber cannot share the multiplexed command connection).
    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}
