//! PilotGate HTTP front end
//!
//! Serves `GET /health`, `GET /v1/models` and `POST /v1/chat/completions`
//! on top of [`pilotgate_core::Orchestrator`].

pub mod error;
pub mod routes;
pub mod wiring;

pub use error::ApiError;
pub use routes::{router, AppState};
pub use wiring::{build, Gateway};
