//! OAuth device-authorization flow

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{AuthError, AuthResult};
use crate::upstream::{Upstream, UpstreamError, UpstreamRequest};

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Added to the interval on every `slow_down`
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Response of the code-issuance endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Lifetime of the device code, seconds
    pub expires_in: u64,
    /// Minimum seconds between polls
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// One answer from the token-polling endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// `authorization_pending`
    Pending,
    /// `slow_down`, optionally with the interval the server now wants
    SlowDown(Option<u64>),
    Issued(String),
    /// `access_denied`
    Denied,
    /// `expired_token`
    Expired,
}

/// The two device-flow endpoints
#[async_trait]
pub trait DeviceAuthApi: Send + Sync {
    async fn request_code(&self) -> AuthResult<DeviceCode>;
    async fn poll_token(&self, device_code: &str) -> AuthResult<PollOutcome>;
}

/// Run the device flow to completion: show the user code, then poll at the
/// server's interval until the token is issued, denied, or the code expires.
///
/// Polling never happens at or after the code's expiry.
pub async fn run_device_flow(api: &dyn DeviceAuthApi, cancel: &CancellationToken) -> AuthResult<String> {
    let code = api.request_code().await?;
    tracing::warn!(
        "To authorize PilotGate, open {} and enter the code {}",
        code.verification_uri,
        code.user_code
    );

    let deadline = Instant::now() + Duration::from_secs(code.expires_in);
    let mut interval = Duration::from_secs(code.interval.max(1));

    loop {
        let next_poll = Instant::now() + interval;
        if next_poll >= deadline {
            return Err(AuthError::CodeExpired);
        }
        tokio::select! {
            _ = tokio::time::sleep_until(next_poll) => {}
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
        }

        match api.poll_token(&code.device_code).await? {
            PollOutcome::Pending => {}
            PollOutcome::SlowDown(requested) => {
                let requested = Duration::from_secs(requested.unwrap_or_default());
                interval = requested.max(interval + SLOW_DOWN_STEP);
                tracing::debug!("device flow asked to slow down, polling every {:?}", interval);
            }
            PollOutcome::Issued(token) => {
                tracing::info!("device authorization complete");
                return Ok(token);
            }
            PollOutcome::Denied => return Err(AuthError::Denied),
            PollOutcome::Expired => return Err(AuthError::CodeExpired),
        }
    }
}

/// Device flow over HTTP form posts
pub struct HttpDeviceAuth {
    upstream: Arc<dyn Upstream>,
    client_id: String,
    scope: String,
    code_url: String,
    token_url: String,
}

impl HttpDeviceAuth {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        client_id: impl Into<String>,
        scope: impl Into<String>,
        code_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            upstream,
            client_id: client_id.into(),
            scope: scope.into(),
            code_url: code_url.into(),
            token_url: token_url.into(),
        }
    }
}

#[async_trait]
impl DeviceAuthApi for HttpDeviceAuth {
    async fn request_code(&self) -> AuthResult<DeviceCode> {
        let request = UpstreamRequest::post_form(
            &self.code_url,
            vec![
                ("client_id".into(), self.client_id.clone()),
                ("scope".into(), self.scope.clone()),
            ],
        );
        let body = self
            .upstream
            .call(request, &CancellationToken::new())
            .await
            .map_err(|e| AuthError::Unavailable(format!("device code request failed: {}", e)))?;
        serde_json::from_value(body).map_err(|e| AuthError::Unavailable(format!("bad device code response: {}", e)))
    }

    async fn poll_token(&self, device_code: &str) -> AuthResult<PollOutcome> {
        let request = UpstreamRequest::post_form(
            &self.token_url,
            vec![
                ("client_id".into(), self.client_id.clone()),
                ("device_code".into(), device_code.to_string()),
                ("grant_type".into(), DEVICE_GRANT_TYPE.into()),
            ],
        );
        // Pending states arrive either as 200 with an `error` field or as 400
        let body = match self.upstream.call(request, &CancellationToken::new()).await {
            Ok(body) => body,
            Err(UpstreamError::Rejected { body, status, .. }) => serde_json::from_str(&body)
                .map_err(|_| AuthError::Unavailable(format!("token polling failed with status {}", status)))?,
            Err(e) => return Err(AuthError::Unavailable(format!("token polling failed: {}", e))),
        };
        parse_poll_response(&body)
    }
}

fn parse_poll_response(body: &Value) -> AuthResult<PollOutcome> {
    if let Some(token) = body.get("access_token").and_then(Value::as_str) {
        return Ok(PollOutcome::Issued(token.to_string()));
    }
    match body.get("error").and_then(Value::as_str) {
        Some("authorization_pending") => Ok(PollOutcome::Pending),
        Some("slow_down") => Ok(PollOutcome::SlowDown(body.get("interval").and_then(Value::as_u64))),
        Some("access_denied") => Ok(PollOutcome::Denied),
        Some("expired_token") => Ok(PollOutcome::Expired),
        Some(other) => Err(AuthError::Unavailable(format!("device authorization failed: {}", other))),
        None => Err(AuthError::Unavailable("unexpected token polling response".into())),
    }
}

/// Device-flow double that replays scripted poll outcomes and records when
/// each poll happened (on the tokio clock).
pub struct ScriptedDeviceAuth {
    code: DeviceCode,
    outcomes: Mutex<VecDeque<PollOutcome>>,
    polls: Mutex<Vec<Instant>>,
    started: Instant,
}

impl ScriptedDeviceAuth {
    pub fn new(interval: u64, expires_in: u64, outcomes: Vec<PollOutcome>) -> Self {
        Self {
            code: DeviceCode {
                device_code: "device-123".into(),
                user_code: "ABCD-1234".into(),
                verification_uri: "https://example.test/login/device".into(),
                expires_in,
                interval,
            },
            outcomes: Mutex::new(outcomes.into()),
            polls: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    /// Offsets of each poll from construction
    pub fn poll_offsets(&self) -> Vec<Duration> {
        self.polls.lock().iter().map(|t| t.duration_since(self.started)).collect()
    }
}

#[async_trait]
impl DeviceAuthApi for ScriptedDeviceAuth {
    async fn request_code(&self) -> AuthResult<DeviceCode> {
        Ok(self.code.clone())
    }

    async fn poll_token(&self, _device_code: &str) -> AuthResult<PollOutcome> {
        self.polls.lock().push(Instant::now());
        Ok(self.outcomes.lock().pop_front().unwrap_or(PollOutcome::Pending))
    }
}
