//! Request-level errors surfaced to the client

use thiserror::Error;

use crate::auth::AuthError;
use crate::upstream::UpstreamError;

/// Why a client request failed.
///
/// Tool failures never appear here; they are fed back to the model as error
/// tool-results.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Rejected before any upstream call
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("tool loop exceeded {0} rounds")]
    ToolLoopExceeded(usize),

    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// HTTP status for the client response
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::Auth(_) => 401,
            GatewayError::Upstream(e) => match e.status() {
                Some(status) if (400..600).contains(&status) => status,
                _ => 502,
            },
            GatewayError::ToolLoopExceeded(_) => 500,
            // nginx's "client closed request"
            GatewayError::Cancelled => 499,
        }
    }

    /// `error.type` in the client-visible body
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::Upstream(UpstreamError::Rejected { .. }) => "upstream_error",
            GatewayError::Upstream(_) => "api_connection_error",
            GatewayError::ToolLoopExceeded(_) => "tool_loop_error",
            GatewayError::Cancelled => "cancelled",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(GatewayError::Auth(AuthError::Expired).status_code(), 401);
        assert_eq!(GatewayError::ToolLoopExceeded(10).status_code(), 500);
        let rejected = GatewayError::from(UpstreamError::rejected(429, "slow down"));
        assert_eq!(rejected.status_code(), 429);
        assert_eq!(rejected.error_type(), "upstream_error");
        let stream = GatewayError::from(UpstreamError::Stream("boom".into()));
        assert_eq!(stream.status_code(), 502);
        assert_eq!(stream.error_type(), "api_connection_error");
    }

    #[test]
    fn test_upstream_message_passes_through() {
        let err = GatewayError::from(UpstreamError::rejected(400, r#"{"error":{"message":"bad model"}}"#));
        assert_eq!(err.to_string(), "upstream rejected request (400): bad model");
    }
}
