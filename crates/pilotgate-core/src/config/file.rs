//! Loading configuration from disk and the environment
//!
//! JSON by default; `.yaml`/`.yml` files are read as YAML. A missing file
//! yields the defaults. Environment overrides are applied last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use super::error::{ConfigError, ConfigResult};
use super::settings::GatewayConfig;

type Override = fn(&mut GatewayConfig, String) -> ConfigResult<()>;

/// Environment variable -> setter
static ENV_OVERRIDES: Lazy<HashMap<&'static str, Override>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Override> = HashMap::new();
    m.insert("PILOTGATE_LISTEN", |c, v| {
        c.listen = v;
        Ok(())
    });
    m.insert("PILOTGATE_API_BASE", |c, v| {
        c.upstream.api_base = Some(v);
        Ok(())
    });
    m.insert("PILOTGATE_TOKEN_FILE", |c, v| {
        c.auth.token_file = Some(PathBuf::from(v));
        Ok(())
    });
    m.insert("PILOTGATE_REASONING_EFFORT", |c, v| {
        c.reasoning_effort = Some(v.parse().map_err(ConfigError::Invalid)?);
        Ok(())
    });
    m
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

/// `<config dir>/pilotgate/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pilotgate").join("config.json"))
}

pub fn parse(content: &str, format: ConfigFormat) -> ConfigResult<GatewayConfig> {
    if content.trim().is_empty() {
        return Ok(GatewayConfig::default());
    }
    match format {
        ConfigFormat::Json => Ok(serde_json::from_str(content)?),
        ConfigFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
        }
    }
}

/// Read `path`; a missing file yields the defaults
pub fn load_file(path: &Path) -> ConfigResult<GatewayConfig> {
    if !path.exists() {
        tracing::debug!("no config at {}, using defaults", path.display());
        return Ok(GatewayConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse(&content, ConfigFormat::from_path(path))
}

/// Apply overrides, looking each variable up with `lookup`
pub fn apply_overrides<F>(config: &mut GatewayConfig, lookup: F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    for (name, set) in ENV_OVERRIDES.iter() {
        if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
            set(config, value).map_err(|e| ConfigError::Invalid(format!("{}: {}", name, e)))?;
        }
    }
    Ok(())
}

/// Load from `path` (or the default location) and apply environment overrides
pub fn load(path: Option<&Path>) -> ConfigResult<GatewayConfig> {
    let mut config = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => load_file(&path)?,
        None => GatewayConfig::default(),
    };
    apply_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

impl GatewayConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_tool_turns == 0 {
            return Err(ConfigError::Invalid("max_tool_turns must be at least 1".into()));
        }
        if let Some(bridge) = &self.tool_bridge {
            if bridge.command.trim().is_empty() {
                return Err(ConfigError::Invalid("tool_bridge.command is empty".into()));
            }
            if bridge.timeout_secs == 0 {
                return Err(ConfigError::Invalid("tool_bridge.timeout_secs must be positive".into()));
            }
        }
        Ok(())
    }
}
