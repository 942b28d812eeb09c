//! Upstream transport error types

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while talking to the upstream backend
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The backend answered with a non-success status
    #[error("upstream rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        /// `error.param` when the body names the offending parameter
        param: Option<String>,
        body: String,
    },

    /// Network/HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A streamed line that could not be decoded
    #[error("malformed upstream chunk: {0}")]
    MalformedChunk(String),

    /// The backend reported an error inside the stream
    #[error("upstream stream error: {0}")]
    Stream(String),

    /// Request was cancelled
    #[error("request cancelled")]
    Cancelled,
}

impl UpstreamError {
    /// Build a rejection from a status code and raw response body
    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let parsed = serde_json::from_str::<Value>(body.trim()).ok();
        let message = parsed
            .as_ref()
            .and_then(extract_error_summary)
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("status {}", status)
                } else {
                    trimmed.to_string()
                }
            });
        let param = parsed
            .as_ref()
            .and_then(|v| v.pointer("/error/param"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self::Rejected {
            status,
            message,
            param,
            body,
        }
    }

    /// HTTP status to surface to the client
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// Pull a human-readable message out of an error body
pub(crate) fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| match value.get("error") {
            Some(Value::String(s)) => Some(s.to_string()),
            _ => None,
        })
        .or_else(|| value.get("message").and_then(|v| v.as_str().map(str::to_owned)));

    summary
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;
