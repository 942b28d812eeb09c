//! Model catalog and wire-format classification

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::auth::Credentials;
use crate::upstream::{Authorization, Upstream, UpstreamError, UpstreamRequest, UpstreamResult, WireFormat};

/// What the gateway needs to know about one model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub wire: WireFormat,
    pub supports_tools: bool,
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            wire: WireFormat::ChatCompletions,
            supports_tools: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    data: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    #[serde(default)]
    supported_endpoints: Vec<String>,
    #[serde(default)]
    capabilities: Option<CatalogCapabilities>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogCapabilities {
    #[serde(default)]
    supports: HashMap<String, serde_json::Value>,
}

impl CatalogEntry {
    fn profile(&self) -> ModelProfile {
        let serves = |path: &str| self.supported_endpoints.iter().any(|e| e == path);
        let wire = if serves(WireFormat::Responses.path()) && !serves(WireFormat::ChatCompletions.path()) {
            WireFormat::Responses
        } else {
            WireFormat::ChatCompletions
        };
        let supports_tools = self
            .capabilities
            .as_ref()
            .and_then(|c| c.supports.get("tool_calls"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        ModelProfile { wire, supports_tools }
    }
}

#[derive(Debug)]
struct Catalog {
    /// Catalog order, for the client-facing model list
    ids: Vec<String>,
    profiles: HashMap<String, ModelProfile>,
}

/// Decides which upstream wire shape each model expects.
///
/// The catalog is fetched on first use and cached for the process lifetime.
/// A failed fetch is not cached; affected requests fall back to
/// chat-completions and the next request tries again.
pub struct ModelEndpointResolver {
    upstream: Arc<dyn Upstream>,
    models_path: String,
    catalog: OnceCell<Catalog>,
}

impl ModelEndpointResolver {
    pub fn new(upstream: Arc<dyn Upstream>, models_path: impl Into<String>) -> Self {
        Self {
            upstream,
            models_path: models_path.into(),
            catalog: OnceCell::new(),
        }
    }

    /// The wire format for `model`; unknown models use chat-completions
    pub async fn endpoint_for(&self, model: &str, credentials: &Credentials, cancel: &CancellationToken) -> WireFormat {
        self.profile(model, credentials, cancel).await.wire
    }

    pub async fn profile(&self, model: &str, credentials: &Credentials, cancel: &CancellationToken) -> ModelProfile {
        match self.catalog(credentials, cancel).await {
            Ok(catalog) => catalog.profiles.get(model).copied().unwrap_or_default(),
            Err(e) => {
                tracing::warn!("model catalog unavailable, assuming chat completions for {}: {}", model, e);
                ModelProfile::default()
            }
        }
    }

    /// Model ids in catalog order
    pub async fn model_ids(&self, credentials: &Credentials, cancel: &CancellationToken) -> UpstreamResult<Vec<String>> {
        Ok(self.catalog(credentials, cancel).await?.ids.clone())
    }

    async fn catalog(&self, credentials: &Credentials, cancel: &CancellationToken) -> UpstreamResult<&Catalog> {
        self.catalog
            .get_or_try_init(|| async {
                let url = format!("{}{}", credentials.service_endpoint.trim_end_matches('/'), self.models_path);
                let request = UpstreamRequest::get(url)
                    .with_auth(Authorization::Bearer(credentials.service_token.clone()));
                let body = self.upstream.call(request, cancel).await?;
                let response: CatalogResponse = serde_json::from_value(body)?;

                let ids = response.data.iter().map(|e| e.id.clone()).collect::<Vec<_>>();
                let profiles = response
                    .data
                    .iter()
                    .map(|e| (e.id.clone(), e.profile()))
                    .collect::<HashMap<_, _>>();
                tracing::info!("model catalog loaded: {} models", ids.len());
                Ok::<_, UpstreamError>(Catalog { ids, profiles })
            })
            .await
    }
}
