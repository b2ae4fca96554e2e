//! Branded ID newtypes.
//!
//! Raw integers and strings are easy to transpose across call sites that
//! take several of them; these newtypes make the compiler catch that.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A user's stable numeric identity, assigned by the account system.
///
/// `0` is never a valid user id; the wire protocol uses it as the
/// "no recipient / broadcast" sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// Whether this id refers to an actual user (nonzero).
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for UserId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Ephemeral identity of one live duplex connection.
///
/// UUID v7 so ids sort roughly by connection time in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Mint a fresh connection id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
