//! Persisted identity token

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::credentials::unix_now;
use super::error::AuthResult;

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    token: String,
    #[serde(default)]
    saved_at: u64,
}

/// The identity token on disk, as a small JSON file.
///
/// This is the only durable state the gateway owns.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/pilotgate/identity.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pilotgate").join("identity.json"))
    }

    /// The stored token, `None` when absent or unreadable
    pub fn load(&self) -> Option<String> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("cannot read {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str::<StoredIdentity>(&content) {
            Ok(stored) if !stored.token.trim().is_empty() => Some(stored.token),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("ignoring malformed token file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, token: &str) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredIdentity {
            token: token.to_string(),
            saved_at: unix_now(),
        };
        let content = serde_json::to_string_pretty(&stored).map_err(|e| super::AuthError::Storage(e.to_string()))?;
        std::fs::write(&self.path, content)?;
        restrict_permissions(&self.path)?;
        tracing::info!("identity token saved to {}", self.path.display());
        Ok(())
    }

    /// Delete the stored token; absent is not an error
    pub fn clear(&self) -> AuthResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
