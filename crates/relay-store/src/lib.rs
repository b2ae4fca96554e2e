//! # relay-store
//!
//! Cache-backed state for the relay chat backend.
//!
//! Every store in this crate follows the same dual-backend contract: a
//! shared redis backend when one is configured, and an in-process
//! fallback with identical TTL semantics when redis is absent or errors
//! at call time. Backend degradation is logged and never fatal.
//!
//! - [`cache::RedisHandle`] — shared async connection + key vocabulary
//! - [`ttl_map::TtlMap`] — the in-memory fallback backend
//! - [`presence::PresenceStore`] — online/offline flags with heartbeat TTL
//! - [`revocation::RevocationStore`] — blacklisted session tokens
//! - [`ratelimit::RateLimiter`] — atomic token-bucket windows
//! - [`messages::MessageStore`] — sqlite direct-message persistence
//!
//! ## Crate Position
//!
//! Depends on `relay-core`; consumed by `relay-server`.

#![deny(unsafe_code)]

pub mod cache;
pub mod messages;
pub mod presence;
pub mod ratelimit;
pub mod revocation;
pub mod ttl_map;

pub use cache::{RedisHandle, CHANNEL_FANOUT};
pub use messages::{MessageStore, StoredMessage};
pub use presence::PresenceStore;
pub use ratelimit::{RateDecision, RateLimitConfig, RateLimiter};
pub use revocation::RevocationStore;
pub use ttl_map::TtlMap;
