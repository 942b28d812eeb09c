//! Per-model reasoning-effort ceilings

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::ReasoningEffort;
use crate::upstream::UpstreamError;

/// Parameter names the backend uses for reasoning effort
const EFFORT_PARAMS: &[&str] = &["reasoning_effort", "reasoning.effort"];

/// Tracks the highest effort each model is known to accept.
///
/// Ceilings are only written after a rejection and live for the process
/// lifetime. Concurrent writers race harmlessly: the worst case is one
/// redundant degrade-and-retry.
#[derive(Debug, Default)]
pub struct ReasoningEffortResolver {
    ceilings: RwLock<HashMap<String, ReasoningEffort>>,
}

impl ReasoningEffortResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The configured effort capped at the model's recorded ceiling
    pub fn resolve(&self, configured: ReasoningEffort, model: &str) -> ReasoningEffort {
        match self.ceilings.read().get(model) {
            Some(&ceiling) => configured.min(ceiling),
            None => configured,
        }
    }

    /// Record `effort` as the highest accepted value for `model`
    pub fn record_ceiling(&self, effort: ReasoningEffort, model: &str) {
        tracing::info!("capping reasoning effort for {} at {}", model, effort);
        self.ceilings.write().insert(model.to_string(), effort);
    }

    pub fn ceiling(&self, model: &str) -> Option<ReasoningEffort> {
        self.ceilings.read().get(model).copied()
    }
}

/// Whether an upstream rejection is about the reasoning-effort parameter.
///
/// Matches status 400/422 where either `error.param` names the effort
/// parameter or the message mentions it.
pub fn is_effort_rejection(error: &UpstreamError) -> bool {
    let UpstreamError::Rejected {
        status,
        message,
        param,
        ..
    } = error
    else {
        return false;
    };
    if !matches!(status, 400 | 422) {
        return false;
    }
    if param.as_deref().is_some_and(|p| EFFORT_PARAMS.contains(&p)) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    EFFORT_PARAMS.iter().any(|p| message.contains(p)) || message.contains("reasoning effort")
}
