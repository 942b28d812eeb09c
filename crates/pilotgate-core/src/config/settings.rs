//! Gateway configuration structure

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::auth::TokenStore;
use crate::logging::LogSettings;
use crate::types::ReasoningEffort;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to
    pub listen: String,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    /// Effort sent with every request; omitted when unset
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Tool rounds allowed per client request
    pub max_tool_turns: usize,
    /// Tool bridge subprocess; no tool dispatch when absent
    pub tool_bridge: Option<ToolBridgeConfig>,
    pub tools: ToolsConfig,
    pub log: LogSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4141".to_string(),
            upstream: UpstreamConfig::default(),
            auth: AuthConfig::default(),
            reasoning_effort: None,
            max_tool_turns: 10,
            tool_bridge: None,
            tools: ToolsConfig::default(),
            log: LogSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Where the identity token is persisted
    pub fn token_path(&self) -> Option<PathBuf> {
        self.auth.token_file.clone().or_else(TokenStore::default_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Overrides the API endpoint returned by the token exchange
    pub api_base: Option<String>,
    /// API endpoint used when the exchange names none
    pub default_api_base: String,
    /// Model catalog path, relative to the API endpoint
    pub models_path: String,
    pub exchange_url: String,
    /// Whole-request timeout, long enough for multi-minute generations
    pub request_timeout_secs: u64,
    /// Sent with every upstream request
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        let mut extra_headers = BTreeMap::new();
        extra_headers.insert(
            "Editor-Version".to_string(),
            format!("PilotGate/{}", env!("CARGO_PKG_VERSION")),
        );
        extra_headers.insert("Copilot-Integration-Id".to_string(), "vscode-chat".to_string());
        Self {
            api_base: None,
            default_api_base: "https://api.githubcopilot.com".to_string(),
            models_path: "/models".to_string(),
            exchange_url: "https://api.github.com/copilot_internal/v2/token".to_string(),
            request_timeout_secs: 600,
            extra_headers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Persisted identity token; defaults to `<config dir>/pilotgate/identity.json`
    pub token_file: Option<PathBuf>,
    /// Program and arguments that print an identity token; empty disables
    pub cli_command: Vec<String>,
    pub device: DeviceFlowConfig,
    /// Refresh the service token this many seconds before it expires
    pub refresh_margin_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_file: None,
            cli_command: vec!["gh".into(), "auth".into(), "token".into()],
            device: DeviceFlowConfig::default(),
            refresh_margin_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFlowConfig {
    pub client_id: String,
    pub scope: String,
    pub code_url: String,
    pub token_url: String,
}

impl Default for DeviceFlowConfig {
    fn default() -> Self {
        Self {
            client_id: "Iv1.b507a08c87ecfe98".to_string(),
            scope: "read:user".to_string(),
            code_url: "https://github.com/login/device/code".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
        }
    }
}

/// Tool bridge subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBridgeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Per-call timeout
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Timeout for the initialization handshake
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    15
}

impl ToolBridgeConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            timeout_secs: default_tool_timeout(),
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

/// Tool permission lists
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tool names, or `"*"` for all
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Refused unless `auto_approve` is set
    pub require_approval: Vec<String>,
    pub auto_approve: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allow: vec!["*".to_string()],
            deny: Vec::new(),
            require_approval: Vec::new(),
            auto_approve: false,
        }
    }
}
