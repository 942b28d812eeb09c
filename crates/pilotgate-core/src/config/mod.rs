//! Gateway configuration
//!
//! - `GatewayConfig`: every section, all with serde defaults
//! - `load`: file (JSON, or YAML by extension) plus `PILOTGATE_*` overrides

mod error;
mod file;
mod settings;

pub use error::{ConfigError, ConfigResult};
pub use file::{apply_overrides, default_config_path, load, load_file, parse, ConfigFormat};
pub use settings::{AuthConfig, DeviceFlowConfig, GatewayConfig, ToolBridgeConfig, ToolsConfig, UpstreamConfig};
