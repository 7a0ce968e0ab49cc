//! Access-token claim decoding.
//!
//! Tokens are JWT-shaped: three dot-separated segments, the middle one a
//! base64url-encoded JSON object carrying an `exp` claim in Unix seconds.
//! The signature is never verified here; the decoded expiry is only used to
//! decide *when* to refresh. The server remains the authority on validity.
//!
//! Every predicate fails closed: a token that cannot be decoded is treated
//! as expired and due for refresh.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::Clock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Claims extracted from an access token payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClaims {
    /// Expiry, Unix epoch seconds
    pub expires_at: i64,
    /// `sub` claim, when present as a string
    pub subject: Option<String>,
    /// Full payload object
    pub raw: Value,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("token is empty")]
    Empty,

    #[error("token has no payload segment")]
    Malformed,

    #[error("payload is not valid base64url: {0}")]
    InvalidBase64(String),

    #[error("payload is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("payload has no numeric exp claim")]
    MissingExpiry,
}

/// Decode the payload segment of `token`.
///
/// ```
/// use core_auth::codec::{decode, DecodeError};
///
/// // {"exp":1700000000,"sub":"u1"}
/// let token = "h.eyJleHAiOjE3MDAwMDAwMDAsInN1YiI6InUxIn0.s";
/// let claims = decode(token).unwrap();
/// assert_eq!(claims.expires_at, 1_700_000_000);
/// assert_eq!(claims.subject.as_deref(), Some("u1"));
///
/// assert_eq!(decode(""), Err(DecodeError::Empty));
/// assert_eq!(decode("not-a-jwt"), Err(DecodeError::Malformed));
/// ```
pub fn decode(token: &str) -> Result<DecodedClaims, DecodeError> {
    if token.trim().is_empty() {
        return Err(DecodeError::Empty);
    }

    let payload = token
        .split('.')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .ok_or(DecodeError::Malformed)?;

    // Some issuers pad the segment even though base64url forbids it
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;

    let raw: Value =
        serde_json::from_slice(&bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    if !raw.is_object() {
        return Err(DecodeError::InvalidJson("payload is not an object".to_string()));
    }

    let expires_at = match raw.get("exp") {
        Some(exp) => exp
            .as_i64()
            .or_else(|| exp.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
            .ok_or(DecodeError::MissingExpiry)?,
        None => return Err(DecodeError::MissingExpiry),
    };

    let subject = raw.get("sub").and_then(Value::as_str).map(str::to_string);

    Ok(DecodedClaims {
        expires_at,
        subject,
        raw,
    })
}

/// Expiry predicates evaluated against an injected clock.
#[derive(Clone)]
pub struct TokenCodec {
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn decode(&self, token: &str) -> Result<DecodedClaims, DecodeError> {
        decode(token)
    }

    /// True when fewer than `threshold` seconds of lifetime remain, or the
    /// token cannot be decoded.
    pub fn is_expiring_soon(&self, token: &str, threshold: Duration) -> bool {
        match decode(token) {
            Ok(claims) => {
                let threshold = i64::try_from(threshold.as_secs()).unwrap_or(i64::MAX);
                self.remaining(&claims) < threshold
            }
            Err(e) => {
                tracing::debug!(error = %e, "Undecodable access token treated as expiring");
                true
            }
        }
    }

    /// True when the expiry is strictly in the past, or the token cannot be
    /// decoded.
    pub fn is_expired(&self, token: &str) -> bool {
        match decode(token) {
            Ok(claims) => claims.expires_at < self.clock.unix_timestamp(),
            Err(_) => true,
        }
    }

    /// Seconds until expiry; `None` when undecodable. Negative once expired.
    pub fn seconds_remaining(&self, token: &str) -> Option<i64> {
        decode(token)
            .ok()
            .map(|claims| self.remaining(&claims))
    }

    // Saturating: `exp` may be any finite JSON number
    fn remaining(&self, claims: &DecodedClaims) -> i64 {
        claims.expires_at.saturating_sub(self.clock.unix_timestamp())
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}
