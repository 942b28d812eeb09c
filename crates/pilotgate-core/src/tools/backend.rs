//! Tool backend trait and a scripted implementation

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::error::{ToolError, ToolsResult};
use crate::types::{ToolDescriptor, ToolResult};

/// Something that can list and run tools. Implemented by the subprocess
/// bridge and by [`MockToolBackend`].
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn list_tools(&self) -> ToolsResult<Vec<ToolDescriptor>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> ToolsResult<ToolResult>;
}

/// In-memory backend for tests: fixed tools, canned results, recorded calls
#[derive(Default)]
pub struct MockToolBackend {
    tools: Vec<ToolDescriptor>,
    results: HashMap<String, ToolResult>,
    calls: Mutex<Vec<(String, Value)>>,
    delay: Option<Duration>,
}

impl MockToolBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool that answers with `result`
    pub fn with_tool(mut self, name: &str, result: ToolResult) -> Self {
        self.tools.push(ToolDescriptor::new(
            name,
            format!("{} tool", name),
            serde_json::json!({"type": "object"}),
        ));
        self.results.insert(name.to_string(), result);
        self
    }

    /// Sleep inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls received so far, as (name, arguments)
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ToolBackend for MockToolBackend {
    async fn list_tools(&self) -> ToolsResult<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> ToolsResult<ToolResult> {
        self.calls.lock().push((name.to_string(), arguments));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.results
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }
}
