//! HTTP routes

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, Method};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use pilotgate_core::types::{ChatCompletionRequest, ModelList};
use pilotgate_core::{aggregate, GatewayError, Orchestrator};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{error_body, ApiError};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Cancelled on shutdown; every request runs under a child of it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn models(State(state): State<AppState>) -> Result<Json<ModelList>, ApiError> {
    Ok(Json(state.orchestrator.models(&state.shutdown).await?))
}

async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let streaming = request.is_streaming();
    let stream = state.orchestrator.complete(request, &state.shutdown).await?;

    if !streaming {
        let completion = aggregate(stream).await?;
        return Ok(Json(completion).into_response());
    }

    let events = stream
        .map(|item| {
            let data = match item {
                Ok(chunk) => serde_json::to_string(&chunk).unwrap_or_default(),
                Err(e) => {
                    tracing::warn!("stream ended with error: {}", e);
                    error_body(&e).to_string()
                }
            };
            Ok::<_, Infallible>(Event::default().data(data))
        })
        .chain(futures::stream::once(async { Ok(Event::default().data("[DONE]")) }));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response())
}
