//! Error taxonomy shared across relay crates.
//!
//! None of these are fatal to the process: authentication failures reject
//! one request, backend degradation downgrades to local fallbacks, slow
//! consumers lose their connection, persistence failures are logged and
//! delivery proceeds.

use thiserror::Error;

/// The relay error hierarchy.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing, malformed, expired, or revoked session token.
    /// Surfaced as a refused connection or HTTP 401, never degraded.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Token bucket exhausted for the caller's key. Recoverable by waiting.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the current window rolls over.
        retry_after_secs: u64,
    },

    /// The shared cache / pub-sub backend is unreachable. Callers fall
    /// back to in-memory state or local-only delivery.
    #[error("shared backend degraded: {0}")]
    BackendDegraded(String),

    /// A connection's mailbox was full; the hub dropped the connection.
    #[error("slow consumer, connection dropped")]
    SlowConsumer,

    /// Storing a chat message failed. Logged; delivery still proceeds.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

/// Crate-wide result alias.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;
