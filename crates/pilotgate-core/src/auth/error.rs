//! Credential error types

use thiserror::Error;

/// Errors from identity resolution and service-token exchange.
///
/// `Clone` so one in-flight exchange can hand the same outcome to every
/// caller awaiting it; payloads are therefore plain strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No source could produce an identity token
    #[error("authentication unavailable: {0}")]
    Unavailable(String),

    /// The identity token was refused by the exchange endpoint
    #[error("identity token expired or revoked")]
    Expired,

    /// The user declined the device authorization
    #[error("device authorization denied")]
    Denied,

    /// The device code expired before the user approved it
    #[error("device authorization expired")]
    CodeExpired,

    /// Service-token exchange failed for a reason other than expiry
    #[error("token exchange failed: {0}")]
    Exchange(String),

    /// Reading or writing the persisted identity token failed
    #[error("token storage error: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for AuthError {
    fn from(e: std::io::Error) -> Self {
        AuthError::Storage(e.to_string())
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
