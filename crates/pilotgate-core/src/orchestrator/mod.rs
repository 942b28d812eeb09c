//! Completion orchestrator
//!
//! Turns one client chat request into one or more upstream turns:
//!
//! ```text
//!   Init ─► AwaitingUpstream ─► Streaming ─┬─► Done
//!                 ▲                        │
//!                 └──── ToolDispatch ◄─────┘  (at most max_tool_turns)
//! ```
//!
//! The first upstream turn is opened before [`Orchestrator::complete`]
//! returns, so credential and rejection errors reach the client as a plain
//! HTTP error. Everything after that arrives through the [`CompletionStream`].

mod aggregate;
mod stream;

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{unix_now, CredentialManager, Credentials};
use crate::error::{GatewayError, GatewayResult};
use crate::resolver::{is_effort_rejection, ModelEndpointResolver, ReasoningEffortResolver};
use crate::tools::ToolRegistry;
use crate::types::{ChatCompletionRequest, ChatMessage, FunctionTool, ModelList, ReasoningEffort, Role};
use crate::upstream::{Authorization, LineStream, TurnRequest, Upstream, UpstreamError, UpstreamRequest, WireFormat};

pub use aggregate::aggregate;
pub use stream::CompletionStream;

/// Knobs taken from the gateway configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Used when the client sends no `reasoning_effort`
    pub reasoning_effort: Option<ReasoningEffort>,
    pub max_tool_turns: usize,
    /// Model catalog path, relative to the service endpoint
    pub models_path: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            reasoning_effort: None,
            max_tool_turns: 10,
            models_path: "/models".to_string(),
        }
    }
}

struct Inner {
    upstream: Arc<dyn Upstream>,
    credentials: Arc<CredentialManager>,
    endpoints: ModelEndpointResolver,
    efforts: ReasoningEffortResolver,
    tools: Arc<ToolRegistry>,
    settings: OrchestratorSettings,
}

/// Shared by every request handler; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Mutable state of one client request across its upstream turns
pub(crate) struct Conversation {
    pub(crate) id: String,
    pub(crate) created: u64,
    pub(crate) model: String,
    pub(crate) wire: WireFormat,
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) tools: Vec<FunctionTool>,
    /// Calls to these are returned to the client instead of dispatched
    pub(crate) client_tools: HashSet<String>,
    pub(crate) effort: Option<ReasoningEffort>,
    pub(crate) extra: serde_json::Map<String, serde_json::Value>,
    pub(crate) credentials: Credentials,
    effort_retried: bool,
    auth_retried: bool,
}

pub(crate) fn upstream_error(error: UpstreamError) -> GatewayError {
    match error {
        UpstreamError::Cancelled => GatewayError::Cancelled,
        other => GatewayError::Upstream(other),
    }
}

impl Orchestrator {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        credentials: Arc<CredentialManager>,
        tools: Arc<ToolRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        let endpoints = ModelEndpointResolver::new(upstream.clone(), settings.models_path.clone());
        Self {
            inner: Arc::new(Inner {
                upstream,
                credentials,
                endpoints,
                efforts: ReasoningEffortResolver::new(),
                tools,
                settings,
            }),
        }
    }

    /// The upstream catalog in OpenAI list shape
    pub async fn models(&self, cancel: &CancellationToken) -> GatewayResult<ModelList> {
        let credentials = self.inner.credentials.valid_credentials().await?;
        let ids = self
            .inner
            .endpoints
            .model_ids(&credentials, cancel)
            .await
            .map_err(upstream_error)?;
        Ok(ModelList::from_ids(ids, "pilotgate"))
    }

    /// Start a completion. Dropping the returned stream cancels the
    /// upstream call and stops any further tool turns.
    pub async fn complete(
        &self,
        request: ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> GatewayResult<CompletionStream> {
        validate(&request)?;
        let cancel = cancel.child_token();
        let inner = &self.inner;

        let credentials = inner.credentials.valid_credentials().await?;
        let profile = inner.endpoints.profile(&request.model, &credentials, &cancel).await;
        let effort = request
            .reasoning_effort
            .or(inner.settings.reasoning_effort)
            .map(|configured| inner.efforts.resolve(configured, &request.model));

        let client_names: HashSet<String> = request.client_tool_names().into_iter().collect();
        let mut tools: Vec<FunctionTool> = request.tools.clone().unwrap_or_default();
        if profile.supports_tools && inner.tools.has_backend() {
            let bridged = inner.tools.offered_tools().await;
            tools.extend(
                bridged
                    .iter()
                    .filter(|t| !client_names.contains(&t.name))
                    .map(|t| t.to_function_tool()),
            );
        }

        let mut conversation = Conversation {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: unix_now(),
            model: request.model,
            wire: profile.wire,
            messages: request.messages,
            tools,
            client_tools: client_names,
            effort,
            extra: request.extra,
            credentials,
            effort_retried: false,
            auth_retried: false,
        };
        info!(
            model = %conversation.model,
            wire = ?conversation.wire,
            effort = ?conversation.effort,
            tools = conversation.tools.len(),
            "starting completion"
        );

        let lines = self.open_turn(&mut conversation, &cancel).await?;
        Ok(stream::spawn(self.clone(), conversation, lines, cancel))
    }

    /// Send the conversation upstream and return the event stream.
    ///
    /// Retries at most once for an effort rejection and at most once for
    /// an expired service token, each once per client request.
    pub(crate) async fn open_turn(
        &self,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> GatewayResult<LineStream> {
        let inner = &self.inner;
        loop {
            // A cache hit unless the service token is about to expire
            conversation.credentials = inner.credentials.valid_credentials().await?;
            let body = conversation.wire.build_request(&TurnRequest {
                model: &conversation.model,
                messages: &conversation.messages,
                tools: &conversation.tools,
                effort: conversation.effort,
                extra: &conversation.extra,
            });
            let url = format!(
                "{}{}",
                conversation.credentials.service_endpoint.trim_end_matches('/'),
                conversation.wire.path()
            );
            let request = UpstreamRequest::post_json(url, body)
                .with_auth(Authorization::Bearer(conversation.credentials.service_token.clone()));

            let error = match inner.upstream.stream(request, cancel).await {
                Ok(lines) => return Ok(lines),
                Err(e) => e,
            };

            if let Some(rejected) = conversation
                .effort
                .filter(|_| !conversation.effort_retried && is_effort_rejection(&error))
            {
                let Some(lower) = rejected.next_lower() else {
                    warn!("{} rejected reasoning effort {}, nothing lower to try", conversation.model, rejected);
                    return Err(upstream_error(error));
                };
                warn!(
                    "{} rejected reasoning effort {}, retrying at {}",
                    conversation.model, rejected, lower
                );
                inner.efforts.record_ceiling(lower, &conversation.model);
                conversation.effort = Some(lower);
                conversation.effort_retried = true;
                continue;
            }

            if error.is_unauthorized() && !conversation.auth_retried {
                warn!("service token refused, exchanging again");
                conversation.auth_retried = true;
                inner.credentials.invalidate_service_token();
                continue;
            }

            debug!("upstream turn failed: {}", error);
            return Err(upstream_error(error));
        }
    }

    pub(crate) fn tools(&self) -> &Arc<ToolRegistry> {
        &self.inner.tools
    }

    pub(crate) fn max_tool_turns(&self) -> usize {
        self.inner.settings.max_tool_turns
    }
}

/// Reject requests that can never succeed upstream
fn validate(request: &ChatCompletionRequest) -> GatewayResult<()> {
    if request.model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("model is required".into()));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages must not be empty".into()));
    }

    let mut issued: HashSet<&str> = HashSet::new();
    for (i, message) in request.messages.iter().enumerate() {
        match message.role {
            Role::Assistant => {
                issued.extend(message.tool_calls.iter().flatten().map(|c| c.id.as_str()));
            }
            Role::Tool => match message.tool_call_id.as_deref() {
                None => {
                    return Err(GatewayError::InvalidRequest(format!(
                        "messages[{}]: tool message without tool_call_id",
                        i
                    )))
                }
                Some(id) if !issued.contains(id) => {
                    return Err(GatewayError::InvalidRequest(format!(
                        "messages[{}]: tool_call_id {} does not match an earlier assistant tool call",
                        i, id
                    )))
                }
                Some(_) => {}
            },
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest::new("gpt-4o", messages)
    }

    #[test]
    fn test_requires_model_and_messages() {
        assert!(matches!(
            validate(&ChatCompletionRequest::new("", vec![ChatMessage::user("Hi")])),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(matches!(validate(&request(vec![])), Err(GatewayError::InvalidRequest(_))));
        assert!(validate(&request(vec![ChatMessage::user("Hi")])).is_ok());
    }

    #[test]
    fn test_tool_message_must_follow_its_call() {
        let call = ToolCall::new("call_1", "grep", "{}");
        let ok = request(vec![
            ChatMessage::user("find it"),
            ChatMessage::assistant_tool_calls(None, vec![call]),
            ChatMessage::tool("call_1", "3 matches"),
        ]);
        assert!(validate(&ok).is_ok());

        let orphan = request(vec![ChatMessage::user("find it"), ChatMessage::tool("call_1", "3 matches")]);
        let err = validate(&orphan).unwrap_err();
        assert!(err.to_string().contains("messages[1]"));

        let mut missing_id = ChatMessage::tool("x", "y");
        missing_id.tool_call_id = None;
        assert!(validate(&request(vec![ChatMessage::user("a"), missing_id])).is_err());
    }
}
