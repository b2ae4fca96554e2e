//! Session tokens: HS256 JWTs carrying the user's id and display name.
//!
//! Token issuance happens at login (outside this core); validation happens
//! on every WebSocket upgrade and authenticated HTTP request. Revocation
//! is a separate concern (`relay-store`): a token can pass signature and
//! expiry checks here and still be refused because it was blacklisted.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{RelayError, Result};
use crate::ids::UserId;

/// Claims embedded in a session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Owning user id.
    pub user_id: i64,
    /// Display name at issue time.
    pub username: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    /// Issued-at, seconds since epoch.
    pub iat: i64,
}

/// The verified identity bound to a connection for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser {
    /// Verified user id.
    pub id: UserId,
    /// Verified display name.
    pub username: String,
}

/// Encoding/decoding key pair for the HS256 signing secret.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    /// Build keys from the shared signing secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Issue a token for `user` valid for `validity` from now.
    pub fn issue_token(&self, id: UserId, username: &str, validity: Duration) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: id.0,
            username: username.to_string(),
            exp: now + validity.as_secs() as i64,
            iat: now,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| RelayError::AuthRejected(format!("token issue failed: {e}")))
    }

    /// Validate signature and expiry, returning the verified identity.
    pub fn validate_token(&self, token: &str) -> Result<AuthUser> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| RelayError::AuthRejected(format!("invalid token: {e}")))?;
        if data.claims.user_id <= 0 {
            return Err(RelayError::AuthRejected("token has no user identity".into()));
        }
        Ok(AuthUser {
            id: UserId(data.claims.user_id),
            username: data.claims.username,
        })
    }

    /// Remaining validity of a token, if any.
    ///
    /// Used when blacklisting at logout: the revocation record only needs
    /// to outlive the token itself.
    pub fn remaining_validity(&self, token: &str) -> Option<Duration> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation).ok()?;
        let remaining = data.claims.exp - Utc::now().timestamp();
        (remaining > 0).then(|| Duration::from_secs(remaining as u64))
    }
}
