//! Logging setup
//!
//! The core logs through `tracing` macros; this installs the subscriber.
//! `PILOTGATE_LOG` (an `EnvFilter` directive) wins over the configured
//! level. Output goes to stderr, or appends to the configured file.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Environment variable holding a filter directive
pub const LOG_ENV: &str = "PILOTGATE_LOG";

static INSTALLED: OnceCell<()> = OnceCell::new();

/// `log` section of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `error`, `warn`, `info`, `debug`, `trace`, or any filter directive
    pub level: String,
    /// Append here instead of writing to stderr
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn build_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls do nothing.
pub fn init(settings: &LogSettings) -> std::io::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let filter = build_filter(settings);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match &settings.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    // Another subscriber may already be installed (tests, embedding apps)
    if let Err(e) = installed {
        tracing::debug!("tracing subscriber already set: {}", e);
    }
    let _ = INSTALLED.set(());
    Ok(())
}
