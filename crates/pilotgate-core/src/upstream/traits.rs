//! Transport trait definition

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use super::error::UpstreamResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Request body encodings used by the backend and the device-flow endpoints
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Authorization header scheme
#[derive(Clone, PartialEq)]
pub enum Authorization {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `Authorization: token <token>` (identity-token exchange)
    Token(String),
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authorization::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Authorization::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

/// An outbound HTTP request
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub url: String,
    pub auth: Option<Authorization>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            auth: None,
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: RequestBody::Json(body),
            ..Self::get(url)
        }
    }

    pub fn post_form(url: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            method: HttpMethod::Post,
            body: RequestBody::Form(fields),
            ..Self::get(url)
        }
    }

    pub fn with_auth(mut self, auth: Authorization) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// JSON body, if any
    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            RequestBody::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Server-sent-event `data:` payloads, in arrival order
pub type LineStream = Pin<Box<dyn Stream<Item = UpstreamResult<String>> + Send>>;

/// Outbound transport to the upstream backend.
///
/// Both calls are cancellable; a cancelled stream simply ends.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// One-shot request returning the decoded JSON body (`Null` when empty)
    async fn call(&self, request: UpstreamRequest, cancel: &CancellationToken) -> UpstreamResult<Value>;

    /// Streamed request returning SSE data payloads
    async fn stream(&self, request: UpstreamRequest, cancel: &CancellationToken) -> UpstreamResult<LineStream>;
}
