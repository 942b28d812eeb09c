//! Tool registry: policy-filtered discovery and execution
//!
//! The ToolRegistry is what the orchestrator talks to:
//! - Lists the backend's tools, filtered by the policy
//! - Checks each requested call against the policy before dispatch
//! - Turns every failure into an error tool-result

use std::sync::Arc;

use serde_json::Value;

use super::backend::ToolBackend;
use super::error::{ToolError, ToolsResult};
use super::policy::ToolPolicy;
use crate::types::{ToolCall, ToolDescriptor, ToolResult};

pub struct ToolRegistry {
    backend: Option<Arc<dyn ToolBackend>>,
    policy: ToolPolicy,
}

impl ToolRegistry {
    /// A registry with no backend; it offers nothing and runs nothing
    pub fn empty() -> Self {
        Self {
            backend: None,
            policy: ToolPolicy::default(),
        }
    }

    pub fn new(backend: Arc<dyn ToolBackend>, policy: ToolPolicy) -> Self {
        Self {
            backend: Some(backend),
            policy,
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Tools the model may be offered. Discovery failures offer nothing.
    pub async fn offered_tools(&self) -> Vec<ToolDescriptor> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };
        match backend.list_tools().await {
            Ok(tools) => {
                let total = tools.len();
                let offered = self.policy.filter(tools);
                tracing::debug!("offering {} of {} bridge tools", offered.len(), total);
                offered
            }
            Err(e) => {
                tracing::warn!("tool discovery failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn call(&self, name: &str, arguments: Value) -> ToolsResult<ToolResult> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| ToolError::BridgeUnavailable("no tool bridge configured".into()))?;
        self.policy.check(name)?;
        backend.call_tool(name, arguments).await
    }

    /// Execute a tool call from the model. Never fails: errors come back as
    /// an error result for the model to read.
    pub async fn execute_tool_call(&self, tool_call: &ToolCall) -> ToolResult {
        let name = tool_call.name();
        let outcome = match tool_call.parsed_arguments() {
            Ok(arguments) => self.call(name, arguments).await,
            Err(e) => Err(ToolError::InvalidArguments {
                name: name.to_string(),
                message: e.to_string(),
            }),
        };
        match outcome {
            Ok(result) => {
                tracing::info!("tool {} finished (error: {})", name, result.is_error);
                result
            }
            Err(e) => {
                tracing::warn!("tool {} failed: {}", name, e);
                ToolResult::error(e.to_string())
            }
        }
    }
}
