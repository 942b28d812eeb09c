//! Credential value types

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A short-lived token for completion calls, derived from the identity token
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceToken {
    pub token: String,
    /// Base URL completion calls go to
    pub endpoint: String,
    /// Expiry, epoch seconds
    pub expires_at: u64,
}

impl ServiceToken {
    /// Usable at `now` with at least `margin_secs` to spare
    pub fn is_fresh(&self, now: u64, margin_secs: u64) -> bool {
        now.saturating_add(margin_secs) < self.expires_at
    }
}

impl std::fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceToken")
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Everything a completion call needs
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity_token: String,
    pub service_token: String,
    pub service_endpoint: String,
    /// Expiry of `service_token`, epoch seconds
    pub service_token_expiry: u64,
}

impl Credentials {
    pub fn new(identity_token: impl Into<String>, service: ServiceToken) -> Self {
        Self {
            identity_token: identity_token.into(),
            service_token: service.token,
            service_endpoint: service.endpoint,
            service_token_expiry: service.expires_at,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("service_endpoint", &self.service_endpoint)
            .field("service_token_expiry", &self.service_token_expiry)
            .finish_non_exhaustive()
    }
}
