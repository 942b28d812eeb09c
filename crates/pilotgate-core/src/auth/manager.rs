//! Credential lifecycle: identity resolution and single-flight exchange

use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::cli::token_from_cli;
use super::credentials::{unix_now, Credentials, ServiceToken};
use super::device::{run_device_flow, DeviceAuthApi};
use super::error::{AuthError, AuthResult};
use super::exchange::TokenExchanger;
use super::store::TokenStore;

type SharedExchange = Shared<BoxFuture<'static, AuthResult<ServiceToken>>>;

#[derive(Default)]
struct ServiceSlot {
    /// Cached token and the identity it was derived from
    current: Option<(String, ServiceToken)>,
    /// The one outstanding exchange, if any
    in_flight: Option<SharedExchange>,
}

/// Produces valid credentials on demand.
///
/// The identity token comes from, in order: memory, the persisted token
/// file, the CLI delegate, the device flow. The service token is cached
/// until `refresh_margin_secs` before expiry; at most one exchange runs at a
/// time and concurrent callers await that same exchange.
pub struct CredentialManager {
    exchanger: Arc<dyn TokenExchanger>,
    store: Option<TokenStore>,
    cli_command: Option<Vec<String>>,
    device: Option<Arc<dyn DeviceAuthApi>>,
    refresh_margin_secs: u64,
    endpoint_override: Option<String>,
    identity: tokio::sync::Mutex<Option<String>>,
    service: Arc<Mutex<ServiceSlot>>,
}

impl CredentialManager {
    pub fn new(exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            exchanger,
            store: None,
            cli_command: None,
            device: None,
            refresh_margin_secs: 60,
            endpoint_override: None,
            identity: tokio::sync::Mutex::new(None),
            service: Arc::new(Mutex::new(ServiceSlot::default())),
        }
    }

    pub fn with_store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cli_command(mut self, command: Vec<String>) -> Self {
        self.cli_command = Some(command).filter(|c| !c.is_empty());
        self
    }

    pub fn with_device_auth(mut self, device: Arc<dyn DeviceAuthApi>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_refresh_margin(mut self, secs: u64) -> Self {
        self.refresh_margin_secs = secs;
        self
    }

    /// Send completion calls here instead of the exchanged endpoint
    pub fn with_endpoint_override(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    /// Start with a known identity token
    pub fn with_identity(self, token: impl Into<String>) -> Self {
        Self {
            identity: tokio::sync::Mutex::new(Some(token.into())),
            ..self
        }
    }

    /// The identity token, resolving it if not yet known.
    ///
    /// Resolution is serialized so at most one device flow runs.
    pub async fn identity_token(&self) -> AuthResult<String> {
        let mut identity = self.identity.lock().await;
        if let Some(token) = identity.as_ref() {
            return Ok(token.clone());
        }
        let token = self.resolve_identity(&CancellationToken::new()).await?;
        *identity = Some(token.clone());
        Ok(token)
    }

    /// Run the device flow unconditionally and persist its token
    pub async fn login(&self, cancel: &CancellationToken) -> AuthResult<String> {
        let mut identity = self.identity.lock().await;
        let token = self.device_flow(cancel).await?;
        *identity = Some(token.clone());
        self.invalidate_service_token();
        Ok(token)
    }

    /// Forget every credential, including the persisted token
    pub async fn logout(&self) -> AuthResult<()> {
        *self.identity.lock().await = None;
        self.service.lock().current = None;
        if let Some(store) = &self.store {
            store.clear()?;
        }
        Ok(())
    }

    async fn resolve_identity(&self, cancel: &CancellationToken) -> AuthResult<String> {
        if let Some(token) = self.store.as_ref().and_then(TokenStore::load) {
            tracing::debug!("identity token loaded from file");
            return Ok(token);
        }

        if let Some(command) = &self.cli_command {
            match token_from_cli(command).await {
                Ok(token) => {
                    tracing::info!("identity token obtained from {}", command[0]);
                    return Ok(token);
                }
                Err(e) => tracing::warn!("CLI delegate failed, falling back to device flow: {}", e),
            }
        }

        self.device_flow(cancel).await
    }

    async fn device_flow(&self, cancel: &CancellationToken) -> AuthResult<String> {
        let Some(device) = &self.device else {
            return Err(AuthError::Unavailable(
                "no persisted token, CLI delegate or device flow configured".into(),
            ));
        };
        let token = run_device_flow(device.as_ref(), cancel).await?;
        if let Some(store) = &self.store {
            store.save(&token)?;
        }
        Ok(token)
    }

    /// A fresh service token for `identity`, exchanging if needed
    pub async fn service_token(&self, identity: &str) -> AuthResult<ServiceToken> {
        let exchange = {
            let mut slot = self.service.lock();
            if let Some((owner, token)) = &slot.current {
                if owner == identity && token.is_fresh(unix_now(), self.refresh_margin_secs) {
                    return Ok(token.clone());
                }
            }
            match &slot.in_flight {
                Some(exchange) => exchange.clone(),
                None => {
                    let exchange = self.start_exchange(identity.to_string());
                    slot.in_flight = Some(exchange.clone());
                    exchange
                }
            }
        };
        exchange.await
    }

    fn start_exchange(&self, identity: String) -> SharedExchange {
        let exchanger = self.exchanger.clone();
        let slot = self.service.clone();
        async move {
            tracing::debug!("exchanging identity token for service token");
            let result = exchanger.exchange(&identity).await;
            let mut slot = slot.lock();
            slot.in_flight = None;
            if let Ok(token) = &result {
                slot.current = Some((identity, token.clone()));
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Drop the cached service token so the next call re-exchanges
    pub fn invalidate_service_token(&self) {
        self.service.lock().current = None;
    }

    async fn forget_identity(&self, stale: &str) -> AuthResult<()> {
        let mut identity = self.identity.lock().await;
        if identity.as_deref() == Some(stale) {
            *identity = None;
        }
        if let Some(store) = &self.store {
            if store.load().as_deref() == Some(stale) {
                store.clear()?;
            }
        }
        self.invalidate_service_token();
        Ok(())
    }

    /// Identity token, service token and endpoint, all usable now.
    ///
    /// If the exchange refuses the identity token, it is forgotten and
    /// resolved once more before giving up.
    pub async fn valid_credentials(&self) -> AuthResult<Credentials> {
        let identity = self.identity_token().await?;
        match self.service_token(&identity).await {
            Ok(service) => Ok(self.credentials(identity, service)),
            Err(AuthError::Expired) => {
                tracing::warn!("identity token refused by exchange, resolving a new one");
                self.forget_identity(&identity).await?;
                let identity = self.identity_token().await?;
                let service = self.service_token(&identity).await?;
                Ok(self.credentials(identity, service))
            }
            Err(e) => Err(e),
        }
    }

    fn credentials(&self, identity: String, mut service: ServiceToken) -> Credentials {
        if let Some(endpoint) = &self.endpoint_override {
            service.endpoint = endpoint.clone();
        }
        Credentials::new(identity, service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MockExchanger, PollOutcome, ScriptedDeviceAuth};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_exchange() {
        let exchanger = Arc::new(MockExchanger::new().with_delay(Duration::from_millis(200)));
        let manager = CredentialManager::new(exchanger.clone()).with_identity("ghu_identity");

        let results = futures::future::join_all((0..16).map(|_| manager.valid_credentials())).await;
        assert_eq!(exchanger.calls(), 1);
        for creds in results {
            assert_eq!(creds.unwrap().service_token, "svc-1");
        }

        // Cached afterwards
        manager.valid_credentials().await.unwrap();
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn test_refreshes_inside_margin() {
        let exchanger = Arc::new(MockExchanger::new().with_lifetime(30));
        let manager = CredentialManager::new(exchanger.clone())
            .with_identity("ghu")
            .with_refresh_margin(60);

        manager.valid_credentials().await.unwrap();
        let second = manager.valid_credentials().await.unwrap();
        assert_eq!(exchanger.calls(), 2);
        assert_eq!(second.service_token, "svc-2");
    }

    #[tokio::test]
    async fn test_invalidate_forces_exchange() {
        let exchanger = Arc::new(MockExchanger::new());
        let manager = CredentialManager::new(exchanger.clone()).with_identity("ghu");

        manager.valid_credentials().await.unwrap();
        manager.invalidate_service_token();
        manager.valid_credentials().await.unwrap();
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn test_loads_persisted_token_and_overrides_endpoint() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("identity.json"));
        store.save("ghu_file").unwrap();

        let manager = CredentialManager::new(Arc::new(MockExchanger::new()))
            .with_store(store)
            .with_endpoint_override("http://localhost:9999");
        let creds = manager.valid_credentials().await.unwrap();
        assert_eq!(creds.identity_token, "ghu_file");
        assert_eq!(creds.service_endpoint, "http://localhost:9999");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_flow_persists_token() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("identity.json"));
        let device = Arc::new(ScriptedDeviceAuth::new(
            1,
            60,
            vec![PollOutcome::Pending, PollOutcome::Issued("ghu_device".into())],
        ));

        let manager = CredentialManager::new(Arc::new(MockExchanger::new()))
            .with_store(store.clone())
            .with_device_auth(device);
        assert_eq!(manager.identity_token().await.unwrap(), "ghu_device");
        assert_eq!(store.load().as_deref(), Some("ghu_device"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_identity_is_replaced_once() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("identity.json"));
        store.save("ghu_old").unwrap();
        let exchanger = Arc::new(MockExchanger::new());
        exchanger.revoke("ghu_old");
        let device = Arc::new(ScriptedDeviceAuth::new(1, 60, vec![PollOutcome::Issued("ghu_new".into())]));

        let manager = CredentialManager::new(exchanger.clone())
            .with_store(store.clone())
            .with_device_auth(device);
        let creds = manager.valid_credentials().await.unwrap();
        assert_eq!(creds.identity_token, "ghu_new");
        assert_eq!(store.load().as_deref(), Some("ghu_new"));
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_without_sources() {
        let manager = CredentialManager::new(Arc::new(MockExchanger::new()));
        assert!(matches!(manager.valid_credentials().await, Err(AuthError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_exchange_failure_is_shared_and_not_cached() {
        let exchanger = Arc::new(MockExchanger::new());
        exchanger.fail_with(AuthError::Exchange("boom".into()));
        let manager = CredentialManager::new(exchanger.clone()).with_identity("ghu");

        assert_eq!(
            manager.valid_credentials().await.unwrap_err(),
            AuthError::Exchange("boom".into())
        );
        assert!(manager.valid_credentials().await.is_err());
        assert_eq!(exchanger.calls(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_delegate_then_logout() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("identity.json"));
        let manager = CredentialManager::new(Arc::new(MockExchanger::new()))
            .with_store(store.clone())
            .with_cli_command(vec!["sh".into(), "-c".into(), "echo ghu_cli".into()]);

        assert_eq!(manager.identity_token().await.unwrap(), "ghu_cli");
        // Only device-flow tokens are persisted
        assert_eq!(store.load(), None);

        manager.logout().await.unwrap();
        assert_eq!(manager.identity_token().await.unwrap(), "ghu_cli");
    }
}
