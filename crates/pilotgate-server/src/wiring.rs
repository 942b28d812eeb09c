//! Build the gateway's components from configuration

use std::sync::Arc;
use std::time::Duration;

use pilotgate_core::auth::{CredentialManager, HttpDeviceAuth, HttpTokenExchanger, TokenStore};
use pilotgate_core::config::GatewayConfig;
use pilotgate_core::tools::{ToolPolicy, ToolRegistry};
use pilotgate_core::upstream::{HttpUpstream, UpstreamError};
use pilotgate_core::{Orchestrator, OrchestratorSettings, ToolBridge};

/// Everything `serve` needs to run and shut down
pub struct Gateway {
    pub orchestrator: Orchestrator,
    pub bridge: Option<Arc<ToolBridge>>,
}

pub fn http_upstream(config: &GatewayConfig) -> Result<Arc<HttpUpstream>, UpstreamError> {
    let headers = config
        .upstream
        .extra_headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let upstream = HttpUpstream::new(Duration::from_secs(config.upstream.request_timeout_secs))?
        .with_default_headers(headers);
    Ok(Arc::new(upstream))
}

pub fn credential_manager(config: &GatewayConfig, upstream: Arc<HttpUpstream>) -> CredentialManager {
    let exchanger = HttpTokenExchanger::new(
        upstream.clone(),
        config.upstream.exchange_url.clone(),
        config.upstream.default_api_base.clone(),
    );
    let device = &config.auth.device;
    let device = HttpDeviceAuth::new(
        upstream,
        device.client_id.clone(),
        device.scope.clone(),
        device.code_url.clone(),
        device.token_url.clone(),
    );

    let mut manager = CredentialManager::new(Arc::new(exchanger))
        .with_cli_command(config.auth.cli_command.clone())
        .with_device_auth(Arc::new(device))
        .with_refresh_margin(config.auth.refresh_margin_secs);
    if let Some(path) = config.token_path() {
        manager = manager.with_store(TokenStore::new(path));
    }
    if let Some(base) = &config.upstream.api_base {
        manager = manager.with_endpoint_override(base.clone());
    }
    manager
}

/// Wire up the orchestrator and start the tool bridge, if configured.
/// A bridge that fails to start is logged and left without tools.
pub async fn build(config: &GatewayConfig) -> Result<Gateway, UpstreamError> {
    let upstream = http_upstream(config)?;
    let credentials = Arc::new(credential_manager(config, upstream.clone()));

    let (tools, bridge) = match &config.tool_bridge {
        Some(bridge_config) => {
            let bridge = Arc::new(ToolBridge::new(bridge_config.clone()));
            if let Err(e) = bridge.start().await {
                tracing::warn!("tool bridge failed to start: {}", e);
            }
            let registry = ToolRegistry::new(bridge.clone(), ToolPolicy::from(&config.tools));
            (registry, Some(bridge))
        }
        None => {
            tracing::info!("no tool bridge configured");
            (ToolRegistry::empty(), None)
        }
    };

    let settings = OrchestratorSettings {
        reasoning_effort: config.reasoning_effort,
        max_tool_turns: config.max_tool_turns,
        models_path: config.upstream.models_path.clone(),
    };
    let orchestrator = Orchestrator::new(upstream, credentials, Arc::new(tools), settings);
    Ok(Gateway { orchestrator, bridge })
}
