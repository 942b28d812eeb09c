//! Credential lifecycle
//!
//! Two chained tokens are involved: a long-lived identity token (persisted
//! file, CLI delegate or device flow) and a short-lived service token
//! exchanged from it. [`CredentialManager`] hands out both, refreshing the
//! service token before it expires.
//!
//! ```rust,ignore
//! use pilotgate_core::auth::{CredentialManager, HttpTokenExchanger, TokenStore};
//!
//! let manager = CredentialManager::new(Arc::new(exchanger))
//!     .with_store(TokenStore::new(path))
//!     .with_cli_command(vec!["gh".into(), "auth".into(), "token".into()]);
//! let creds = manager.valid_credentials().await?;
//! ```

mod cli;
mod credentials;
mod device;
mod error;
mod exchange;
mod manager;
mod store;

pub use cli::token_from_cli;
pub use credentials::{unix_now, Credentials, ServiceToken};
pub use device::{run_device_flow, DeviceAuthApi, DeviceCode, HttpDeviceAuth, PollOutcome, ScriptedDeviceAuth};
pub use error::{AuthError, AuthResult};
pub use exchange::{HttpTokenExchanger, MockExchanger, TokenExchanger};
pub use manager::CredentialManager;
pub use store::TokenStore;
