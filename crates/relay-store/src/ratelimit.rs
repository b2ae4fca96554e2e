//! Distributed rate limiter: token buckets refilled per fixed window.
//!
//! A bucket for key `K` starts each window holding `limit` tokens; every
//! accepted check takes one. The check-and-decrement runs as a single Lua
//! script so concurrent callers across instances never double-spend. An
//! absent bucket is a full bucket.
//!
//! On a redis error at call time the limiter **fails open**: the request
//! is allowed and full capacity is reported. Availability beats strict
//! enforcement here. With no redis configured at all, buckets live in
//! process memory with identical semantics (single-instance deployments
//! and tests).

use parking_lot::Mutex;
use redis::Script;
use relay_core::UserId;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::cache::{RedisHandle, PREFIX_RATELIMIT};

/// Atomic read-or-initialize / compare / decrement.
const TOKEN_BUCKET_SCRIPT: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local current = redis.call('GET', key)

if current == false then
    redis.call('SET', key, limit - 1, 'EX', window)
    return {1, limit - 1}
end

current = tonumber(current)
if current > 0 then
    redis.call('DECR', key)
    return {1, current - 1}
end

return {0, 0}
";

/// Token allowance per fixed window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Tokens granted at each window start.
    pub limit: u32,
    /// Window length; also the bucket key TTL.
    pub window: Duration,
}

impl RateLimitConfig {
    /// Sensitive endpoints (login, logout).
    pub const SENSITIVE: Self = Self {
        limit: 30,
        window: Duration::from_secs(60),
    };
    /// General API traffic.
    pub const GENERAL: Self = Self {
        limit: 300,
        window: Duration::from_secs(60),
    };
    /// Read-only endpoints.
    pub const READ_ONLY: Self = Self {
        limit: 600,
        window: Duration::from_secs(60),
    };
    /// Per-user WebSocket message throughput.
    pub const WS_MESSAGE: Self = Self {
        limit: 120,
        window: Duration::from_secs(60),
    };
}

/// Outcome of one rate check.
#[derive(Clone, Copy, Debug)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Tokens left in the current window.
    pub remaining: u32,
    /// Time until the window rolls over (Retry-After on denial).
    pub retry_after: Duration,
}

struct LocalBucket {
    expires_epoch: u64,
    remaining: u32,
}

/// Per-key token-bucket counters evaluated atomically against the shared
/// store.
pub struct RateLimiter {
    redis: Option<RedisHandle>,
    script: Script,
    local: Mutex<HashMap<String, LocalBucket>>,
}

impl RateLimiter {
    /// Build the limiter; `None` keeps buckets in process memory.
    pub fn new(redis: Option<RedisHandle>) -> Self {
        Self {
            redis,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Check-and-decrement the bucket for `subject` under `config`.
    pub async fn check(&self, subject: &str, config: RateLimitConfig) -> RateDecision {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let window_secs = config.window.as_secs().max(1);
        let bucket = now / window_secs;
        let retry_after = Duration::from_secs(window_secs - (now % window_secs));
        let window_key = format!("{PREFIX_RATELIMIT}{subject}:{bucket}");

        if let Some(redis) = &self.redis {
            let mut conn = redis.connection();
            let result: redis::RedisResult<(i64, i64)> = self
                .script
                .key(&window_key)
                .arg(config.limit)
                .arg(window_secs)
                .invoke_async(&mut conn)
                .await;
            return match result {
                Ok((allowed, remaining)) => RateDecision {
                    allowed: allowed == 1,
                    remaining: remaining.max(0) as u32,
                    retry_after,
                },
                Err(e) => {
                    // fail open: availability over strict enforcement
                    warn!(error = %e, subject, "rate limiter backend error, failing open");
                    RateDecision {
                        allowed: true,
                        remaining: config.limit,
                        retry_after,
                    }
                }
            };
        }

        self.check_local(&window_key, config, now, window_secs, retry_after)
    }

    /// Per-user WebSocket message throttle. Fail-open like every check.
    pub async fn check_user_message(&self, user: UserId) -> bool {
        let subject = format!("ws:message:user:{user}");
        self.check(&subject, RateLimitConfig::WS_MESSAGE)
            .await
            .allowed
    }

    fn check_local(
        &self,
        window_key: &str,
        config: RateLimitConfig,
        now: u64,
        window_secs: u64,
        retry_after: Duration,
    ) -> RateDecision {
        let mut buckets = self.local.lock();
        if buckets.len() > 1024 {
            buckets.retain(|_, b| b.expires_epoch > now);
        }

        let expires_epoch = (now / window_secs + 1) * window_secs;
        let bucket = buckets
            .entry(window_key.to_string())
            .or_insert_with(|| LocalBucket {
                expires_epoch,
                remaining: config.limit,
            });
        // a stale entry under the same key means the window rolled over
        if bucket.expires_epoch <= now {
            bucket.expires_epoch = expires_epoch;
            bucket.remaining = config.limit;
        }

        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            RateDecision {
                allowed: true,
                remaining: bucket.remaining,
                retry_after,
            }
        } else {
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after,
            }
        }
    }
}
