//! Tool error types

use thiserror::Error;

/// Errors from tool discovery and invocation.
///
/// None of these fail a client request; the orchestrator turns them into an
/// error tool-result so the model learns the tool failed.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool not permitted: {0}")]
    NotPermitted(String),

    #[error("tool requires approval: {0}")]
    ApprovalRequired(String),

    #[error("invalid arguments for {name}: {message}")]
    InvalidArguments { name: String, message: String },

    #[error("tool {name} timed out after {secs}s")]
    Timeout { name: String, secs: u64 },

    #[error("tool bridge unavailable: {0}")]
    BridgeUnavailable(String),

    /// JSON-RPC error response from the bridge
    #[error("tool bridge error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ToolsResult<T> = Result<T, ToolError>;
