//! PilotGate Core
//!
//! Runtime pieces of a local gateway that serves an OpenAI-compatible chat
//! API from a hosted coding-assistant backend:
//!
//! - `orchestrator`: per-request state machine; streams output, runs tool
//!   turns, degrades reasoning effort on rejection
//! - `bridge`: tool server child process spoken to over JSON-RPC lines
//! - `auth`: identity token (file, CLI delegate, device flow) and the
//!   single-flight service-token exchange
//! - `resolver`: per-model effort ceilings and wire-format selection
//! - `upstream`: HTTP transport and the two upstream wire formats
//!
//! ```rust,ignore
//! use pilotgate_core::orchestrator::{aggregate, Orchestrator, OrchestratorSettings};
//!
//! let orchestrator = Orchestrator::new(upstream, credentials, tools, OrchestratorSettings::default());
//! let stream = orchestrator.complete(request, &cancel).await?;
//! let completion = aggregate(stream).await?;
//! ```

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod resolver;
pub mod tools;
pub mod types;
pub mod upstream;

pub use error::{GatewayError, GatewayResult};

pub use types::{
    ChatChunk, ChatCompletion, ChatCompletionRequest, ChatMessage, FinishReason, ModelList, ReasoningEffort, Role,
    ToolCall, ToolDescriptor, ToolResult,
};

pub use auth::{AuthError, CredentialManager, Credentials};
pub use bridge::ToolBridge;
pub use config::GatewayConfig;
pub use orchestrator::{aggregate, CompletionStream, Orchestrator, OrchestratorSettings};
pub use tools::{ToolPolicy, ToolRegistry};
pub use upstream::{HttpUpstream, Upstream, UpstreamError};
