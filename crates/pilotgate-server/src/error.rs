//! Client-visible error bodies

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pilotgate_core::GatewayError;
use serde_json::{json, Value};

/// `{error: {message, type}}`
pub fn error_body(error: &GatewayError) -> Value {
    json!({
        "error": {
            "message": error.to_string(),
            "type": error.error_type(),
        }
    })
}

/// A [`GatewayError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!("request rejected: {}", self.0);
        }
        (status, Json(error_body(&self.0))).into_response()
    }
}
