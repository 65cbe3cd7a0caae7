//! Access credentials and the identity they belong to.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Short-lived access credential.
///
/// `expires_at` is advisory: the server may reject a credential earlier
/// (revocation), and tokens without a readable `exp` claim leave it unknown.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    /// Expiry as Unix seconds, if known.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct ExpClaim {
    exp: Option<i64>,
}

impl Credential {
    /// Wrap a token issued by the server, reading its expiry from the
    /// payload segment when the token is JWT-shaped.
    #[must_use]
    pub fn from_token(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = parse_expiry(&token);
        Self { token, expires_at }
    }

    /// Whether the credential is known to be expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Whether the credential expires within `margin` of `now`.
    ///
    /// Unknown expiry never counts as expiring.
    #[must_use]
    pub fn expires_within(&self, now: i64, margin: Duration) -> bool {
        let margin = i64::try_from(margin.as_secs()).unwrap_or(i64::MAX);
        self.expires_at
            .is_some_and(|exp| exp <= now.saturating_add(margin))
    }
}

fn parse_expiry(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice::<ExpClaim>(&bytes).ok()?.exp
}

/// Identity of the logged-in principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: serde_json::Value,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// What the credential store persists between process runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub credential: Credential,
    #[serde(default)]
    pub principal: Option<Principal>,
}

/// Result of a successful login exchange.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub credential: Credential,
    pub principal: Principal,
}
