//! Identity-token to service-token exchange

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::credentials::{unix_now, ServiceToken};
use super::error::{AuthError, AuthResult};
use crate::upstream::{Authorization, Upstream, UpstreamRequest};

/// Trades an identity token for a short-lived service token
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// `AuthError::Expired` means the identity token itself was refused
    async fn exchange(&self, identity_token: &str) -> AuthResult<ServiceToken>;
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    refresh_in: Option<u64>,
    #[serde(default)]
    endpoints: Option<ExchangeEndpoints>,
}

#[derive(Debug, Deserialize)]
struct ExchangeEndpoints {
    api: Option<String>,
}

/// Exchange over HTTP: `GET <exchange_url>` with `Authorization: token <identity>`
pub struct HttpTokenExchanger {
    upstream: Arc<dyn Upstream>,
    exchange_url: String,
    default_endpoint: String,
}

impl HttpTokenExchanger {
    /// `default_endpoint` is used when the response names no API endpoint
    pub fn new(upstream: Arc<dyn Upstream>, exchange_url: impl Into<String>, default_endpoint: impl Into<String>) -> Self {
        Self {
            upstream,
            exchange_url: exchange_url.into(),
            default_endpoint: default_endpoint.into(),
        }
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, identity_token: &str) -> AuthResult<ServiceToken> {
        let request = UpstreamRequest::get(&self.exchange_url).with_auth(Authorization::Token(identity_token.to_string()));
        let body = match self.upstream.call(request, &CancellationToken::new()).await {
            Ok(body) => body,
            Err(e) if e.is_unauthorized() => return Err(AuthError::Expired),
            Err(e) => return Err(AuthError::Exchange(e.to_string())),
        };
        let response: ExchangeResponse =
            serde_json::from_value(body).map_err(|e| AuthError::Exchange(format!("bad exchange response: {}", e)))?;

        let expires_at = response
            .expires_at
            .or_else(|| response.refresh_in.map(|secs| unix_now() + secs))
            .unwrap_or_else(|| unix_now() + 600);
        let endpoint = response
            .endpoints
            .and_then(|e| e.api)
            .unwrap_or_else(|| self.default_endpoint.clone());

        tracing::debug!("service token obtained for {}, expires at {}", endpoint, expires_at);
        Ok(ServiceToken {
            token: response.token,
            endpoint,
            expires_at,
        })
    }
}

/// Counting exchanger for tests
pub struct MockExchanger {
    calls: AtomicUsize,
    delay: Duration,
    lifetime_secs: u64,
    /// Identity tokens refused with `Expired`
    revoked: Mutex<Vec<String>>,
    failure: Mutex<Option<AuthError>>,
}

impl MockExchanger {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            lifetime_secs: 1800,
            revoked: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// Sleep inside every exchange
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Lifetime of issued tokens
    pub fn with_lifetime(mut self, secs: u64) -> Self {
        self.lifetime_secs = secs;
        self
    }

    pub fn revoke(&self, identity_token: &str) {
        self.revoked.lock().push(identity_token.to_string());
    }

    /// Fail every following exchange with `error`
    pub fn fail_with(&self, error: AuthError) {
        *self.failure.lock() = Some(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockExchanger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenExchanger for MockExchanger {
    async fn exchange(&self, identity_token: &str) -> AuthResult<ServiceToken> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if self.revoked.lock().iter().any(|t| t == identity_token) {
            return Err(AuthError::Expired);
        }
        Ok(ServiceToken {
            token: format!("svc-{}", n),
            endpoint: "https://api.test".to_string(),
            expires_at: unix_now() + self.lifetime_secs,
        })
    }
}
