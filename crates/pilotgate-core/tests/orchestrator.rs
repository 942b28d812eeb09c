//! End-to-end completion scenarios against scripted collaborators

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pilotgate_core::auth::{CredentialManager, MockExchanger};
use pilotgate_core::orchestrator::{aggregate, CompletionStream, Orchestrator, OrchestratorSettings};
use pilotgate_core::tools::{MockToolBackend, ToolPolicy, ToolRegistry};
use pilotgate_core::types::{
    ChatChunk, ChatCompletionRequest, ChatMessage, FinishReason, FunctionDefinition, FunctionTool, ReasoningEffort,
    ToolResult,
};
use pilotgate_core::upstream::{Authorization, ScriptedReply, ScriptedUpstream};
use pilotgate_core::GatewayError;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn chunk(delta: Value, finish: Option<&str>) -> String {
    json!({
        "id": "up-1",
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
    })
    .to_string()
}

fn catalog() -> ScriptedReply {
    ScriptedReply::Json(json!({
        "data": [
            {"id": "gpt-4o", "supported_endpoints": ["/chat/completions"]},
            {"id": "gpt-5-codex", "supported_endpoints": ["/responses"]}
        ]
    }))
}

fn grep_call_stream() -> ScriptedReply {
    ScriptedReply::stream([
        chunk(
            json!({"tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                "function": {"name": "grep", "arguments": "{\"pattern\":"}}]}),
            None,
        ),
        chunk(json!({"tool_calls": [{"index": 0, "function": {"arguments": "\"func\"}"}}]}), None),
        chunk(json!({}), Some("tool_calls")),
        "[DONE]".to_string(),
    ])
}

fn text_stream(text: &str) -> ScriptedReply {
    ScriptedReply::stream([
        chunk(json!({"role": "assistant", "content": text}), None),
        chunk(json!({}), Some("stop")),
        "[DONE]".to_string(),
    ])
}

struct Harness {
    upstream: Arc<ScriptedUpstream>,
    exchanger: Arc<MockExchanger>,
    orchestrator: Orchestrator,
}

fn harness(tools: ToolRegistry, settings: OrchestratorSettings) -> Harness {
    let upstream = Arc::new(ScriptedUpstream::new());
    upstream.push("/models", catalog());
    let exchanger = Arc::new(MockExchanger::new());
    let credentials = Arc::new(CredentialManager::new(exchanger.clone()).with_identity("ghu_test"));
    let orchestrator = Orchestrator::new(upstream.clone(), credentials, Arc::new(tools), settings);
    Harness {
        upstream,
        exchanger,
        orchestrator,
    }
}

fn hi() -> ChatCompletionRequest {
    ChatCompletionRequest::new("gpt-4o", vec![ChatMessage::user("Hi")])
}

async fn collect(stream: CompletionStream) -> Vec<Result<ChatChunk, GatewayError>> {
    stream.collect().await
}

fn content_of(chunks: &[Result<ChatChunk, GatewayError>]) -> String {
    chunks
        .iter()
        .filter_map(|c| c.as_ref().ok())
        .filter_map(|c| c.content())
        .collect()
}

fn completion_bodies(upstream: &ScriptedUpstream, suffix: &str) -> Vec<Value> {
    upstream
        .requests_to(suffix)
        .iter()
        .filter_map(|r| r.request.json_body().cloned())
        .collect()
}

#[tokio::test]
async fn test_content_streams_through() {
    let h = harness(ToolRegistry::empty(), OrchestratorSettings::default());
    h.upstream.push("/chat/completions", text_stream("Hello!"));

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    let chunks = collect(stream).await;

    assert_eq!(content_of(&chunks), "Hello!");
    let first = chunks[0].as_ref().unwrap();
    assert_eq!(first.choices[0].delta.role, Some(pilotgate_core::Role::Assistant));
    let last = chunks.last().unwrap().as_ref().unwrap();
    assert_eq!(last.finish_reason(), Some(&FinishReason::Stop));

    let recorded = h.upstream.requests_to("/chat/completions");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].url, "https://api.test/chat/completions");
    assert_eq!(recorded[0].request.auth, Some(Authorization::Bearer("svc-1".into())));
    let body = recorded[0].request.json_body().unwrap();
    assert_eq!(body["stream"], true);
    assert!(body.get("reasoning_effort").is_none());
    assert!(body.get("tools").is_none());
}

#[tokio::test]
async fn test_bridge_tool_round_trip_is_invisible() {
    let backend = Arc::new(MockToolBackend::new().with_tool("grep", ToolResult::success("3 matches")));
    let h = harness(
        ToolRegistry::new(backend.clone(), ToolPolicy::allow_all()),
        OrchestratorSettings::default(),
    );
    h.upstream
        .push("/chat/completions", grep_call_stream())
        .push("/chat/completions", text_stream("Found 3 matches."));

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    let chunks = collect(stream).await;

    assert!(chunks.iter().all(|c| c.is_ok()));
    assert_eq!(content_of(&chunks), "Found 3 matches.");
    assert!(chunks
        .iter()
        .filter_map(|c| c.as_ref().ok())
        .all(|c| c.choices[0].delta.tool_calls.is_none()));
    assert_eq!(
        chunks.last().unwrap().as_ref().unwrap().finish_reason(),
        Some(&FinishReason::Stop)
    );

    assert_eq!(backend.calls(), vec![("grep".to_string(), json!({"pattern": "func"}))]);

    let bodies = completion_bodies(&h.upstream, "/chat/completions");
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["tools"][0]["function"]["name"], "grep");
    let messages = bodies[1]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
    assert_eq!(messages[1]["tool_calls"][0]["function"]["arguments"], "{\"pattern\":\"func\"}");
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["tool_call_id"], "call_1");
    assert_eq!(messages[2]["content"], "3 matches");
}

#[tokio::test]
async fn test_effort_rejection_degrades_once_and_sticks() {
    let settings = OrchestratorSettings {
        reasoning_effort: Some(ReasoningEffort::XHigh),
        ..Default::default()
    };
    let h = harness(ToolRegistry::empty(), settings);
    h.upstream
        .push(
            "/chat/completions",
            ScriptedReply::reject(
                400,
                r#"{"error":{"message":"Unsupported value: 'xhigh' is not supported with this model.","param":"reasoning_effort"}}"#,
            ),
        )
        .push("/chat/completions", text_stream("ok"));

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    assert_eq!(content_of(&collect(stream).await), "ok");

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    assert_eq!(content_of(&collect(stream).await), "ok");

    let efforts: Vec<Value> = completion_bodies(&h.upstream, "/chat/completions")
        .iter()
        .map(|b| b["reasoning_effort"].clone())
        .collect();
    assert_eq!(efforts, vec![json!("xhigh"), json!("high"), json!("high")]);
}

#[tokio::test]
async fn test_second_effort_rejection_is_surfaced() {
    let settings = OrchestratorSettings {
        reasoning_effort: Some(ReasoningEffort::High),
        ..Default::default()
    };
    let h = harness(ToolRegistry::empty(), settings);
    h.upstream.push(
        "/chat/completions",
        ScriptedReply::reject(400, r#"{"error":{"message":"reasoning_effort is not supported"}}"#),
    );

    let err = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(h.upstream.requests_to("/chat/completions").len(), 2);
}

#[tokio::test]
async fn test_other_rejections_are_not_retried() {
    let settings = OrchestratorSettings {
        reasoning_effort: Some(ReasoningEffort::High),
        ..Default::default()
    };
    let h = harness(ToolRegistry::empty(), settings);
    h.upstream.push(
        "/chat/completions",
        ScriptedReply::reject(429, r#"{"error":{"message":"rate limited"}}"#),
    );

    let err = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.status_code(), 429);
    assert_eq!(h.upstream.requests_to("/chat/completions").len(), 1);

    // No ceiling was learned from a rate limit
    h.upstream.push("/chat/completions", text_stream("ok"));
    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    assert_eq!(content_of(&collect(stream).await), "ok");
    let last = completion_bodies(&h.upstream, "/chat/completions").pop().unwrap();
    assert_eq!(last["reasoning_effort"], "high");
}

#[tokio::test]
async fn test_unauthorized_turn_re_exchanges_once() {
    let h = harness(ToolRegistry::empty(), OrchestratorSettings::default());
    h.upstream
        .push("/chat/completions", ScriptedReply::reject(401, "token expired"))
        .push("/chat/completions", text_stream("ok"));

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    assert_eq!(content_of(&collect(stream).await), "ok");
    assert_eq!(h.exchanger.calls(), 2);

    let recorded = h.upstream.requests_to("/chat/completions");
    assert_eq!(recorded[1].request.auth, Some(Authorization::Bearer("svc-2".into())));
}

#[tokio::test]
async fn test_expired_service_token_is_refreshed_between_tool_turns() {
    let upstream = Arc::new(ScriptedUpstream::new());
    upstream.push("/models", catalog());
    upstream
        .push("/chat/completions", grep_call_stream())
        .push("/chat/completions", text_stream("Found 3 matches."));
    let exchanger = Arc::new(MockExchanger::new().with_lifetime(2));
    let credentials = Arc::new(
        CredentialManager::new(exchanger.clone())
            .with_identity("ghu_test")
            .with_refresh_margin(0),
    );
    let backend = Arc::new(
        MockToolBackend::new()
            .with_tool("grep", ToolResult::success("3 matches"))
            .with_delay(Duration::from_secs(3)),
    );
    let orchestrator = Orchestrator::new(
        upstream.clone(),
        credentials,
        Arc::new(ToolRegistry::new(backend, ToolPolicy::allow_all())),
        OrchestratorSettings::default(),
    );

    let stream = orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    assert_eq!(content_of(&collect(stream).await), "Found 3 matches.");

    let recorded = upstream.requests_to("/chat/completions");
    assert_eq!(recorded.len(), 2);
    assert!(exchanger.calls() >= 2);
    assert_ne!(recorded[0].request.auth, recorded[1].request.auth);
}

#[tokio::test]
async fn test_truncated_stream_is_an_error() {
    let h = harness(ToolRegistry::empty(), OrchestratorSettings::default());
    h.upstream.push(
        "/chat/completions",
        ScriptedReply::stream([chunk(json!({"content": "Hal"}), None)]),
    );

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    let chunks = collect(stream).await;
    assert_eq!(content_of(&chunks), "Hal");
    assert!(chunks
        .iter()
        .filter_map(|c| c.as_ref().ok())
        .all(|c| c.finish_reason().is_none()));
    match chunks.last() {
        Some(Err(GatewayError::Upstream(e))) => assert!(e.to_string().contains("ended before completion")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_length_cut_tool_calls_are_not_dispatched() {
    let backend = Arc::new(MockToolBackend::new().with_tool("grep", ToolResult::success("3 matches")));
    let h = harness(
        ToolRegistry::new(backend.clone(), ToolPolicy::allow_all()),
        OrchestratorSettings::default(),
    );
    h.upstream.push(
        "/chat/completions",
        ScriptedReply::stream([
            chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                    "function": {"name": "grep", "arguments": "{\"pattern\":\"fu"}}]}),
                None,
            ),
            chunk(json!({}), Some("length")),
            "[DONE]".to_string(),
        ]),
    );

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    let completion = aggregate(stream).await.unwrap();
    assert!(backend.calls().is_empty());
    assert_eq!(h.upstream.requests_to("/chat/completions").len(), 1);

    let choice = &completion.choices[0];
    assert_eq!(choice.finish_reason, Some(FinishReason::Length));
    let calls = choice.message.tool_calls.as_ref().unwrap();
    assert_eq!(calls[0].function.arguments, "{\"pattern\":\"fu");
}

#[tokio::test]
async fn test_invalid_request_never_reaches_upstream() {
    let h = harness(ToolRegistry::empty(), OrchestratorSettings::default());
    let request = ChatCompletionRequest::new("gpt-4o", vec![]);
    let err = h.orchestrator.complete(request, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert!(h.upstream.requests().is_empty());
    assert_eq!(h.exchanger.calls(), 0);
}

#[tokio::test]
async fn test_malformed_chunk_is_skipped() {
    let h = harness(ToolRegistry::empty(), OrchestratorSettings::default());
    h.upstream.push(
        "/chat/completions",
        ScriptedReply::stream([
            chunk(json!({"content": "Hel"}), None),
            "{not json".to_string(),
            chunk(json!({"content": "lo"}), Some("stop")),
        ]),
    );

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    let chunks = collect(stream).await;
    assert!(chunks.iter().all(|c| c.is_ok()));
    assert_eq!(content_of(&chunks), "Hello");
}

#[tokio::test]
async fn test_disallowed_tool_is_refused_without_a_backend_call() {
    let backend = Arc::new(
        MockToolBackend::new()
            .with_tool("search", ToolResult::success("found"))
            .with_tool("delete", ToolResult::success("gone")),
    );
    let h = harness(
        ToolRegistry::new(backend.clone(), ToolPolicy::allow_all().with_allow(["search"])),
        OrchestratorSettings::default(),
    );
    h.upstream
        .push(
            "/chat/completions",
            ScriptedReply::stream([
                chunk(
                    json!({"tool_calls": [{"index": 0, "id": "call_d", "type": "function",
                        "function": {"name": "delete", "arguments": "{}"}}]}),
                    Some("tool_calls"),
                ),
            ]),
        )
        .push("/chat/completions", text_stream("I may not delete that."));

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    assert_eq!(content_of(&collect(stream).await), "I may not delete that.");
    assert!(backend.calls().is_empty());

    let bodies = completion_bodies(&h.upstream, "/chat/completions");
    let offered: Vec<&str> = bodies[0]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["function"]["name"].as_str())
        .collect();
    assert_eq!(offered, vec!["search"]);
    let tool_message = &bodies[1]["messages"][2];
    assert!(tool_message["content"].as_str().unwrap().starts_with("Error: "));
}

#[tokio::test]
async fn test_runaway_tool_loop_ends_with_error() {
    let backend = Arc::new(MockToolBackend::new().with_tool("grep", ToolResult::success("again")));
    let settings = OrchestratorSettings {
        max_tool_turns: 2,
        ..Default::default()
    };
    let h = harness(ToolRegistry::new(backend.clone(), ToolPolicy::allow_all()), settings);
    h.upstream.push("/chat/completions", grep_call_stream());

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    let chunks = collect(stream).await;
    assert!(matches!(chunks.last(), Some(Err(GatewayError::ToolLoopExceeded(2)))));
    assert_eq!(backend.calls().len(), 2);
    assert_eq!(h.upstream.requests_to("/chat/completions").len(), 3);
}

#[tokio::test]
async fn test_client_declared_tool_calls_are_returned() {
    let backend = Arc::new(MockToolBackend::new().with_tool("grep", ToolResult::success("3 matches")));
    let h = harness(
        ToolRegistry::new(backend.clone(), ToolPolicy::allow_all()),
        OrchestratorSettings::default(),
    );
    h.upstream.push(
        "/chat/completions",
        ScriptedReply::stream([chunk(
            json!({"tool_calls": [{"index": 0, "id": "call_e", "type": "function",
                "function": {"name": "edit_file", "arguments": "{\"path\":\"a.rs\"}"}}]}),
            Some("tool_calls"),
        )]),
    );

    let mut request = hi();
    request.tools = Some(vec![FunctionTool {
        kind: "function".into(),
        function: FunctionDefinition {
            name: "edit_file".into(),
            description: None,
            parameters: Some(json!({"type": "object"})),
        },
    }]);
    let stream = h.orchestrator.complete(request, &CancellationToken::new()).await.unwrap();
    let completion = aggregate(stream).await.unwrap();

    let choice = &completion.choices[0];
    assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
    let calls = choice.message.tool_calls.as_ref().unwrap();
    assert_eq!(calls[0].id, "call_e");
    assert_eq!(calls[0].function.name, "edit_file");
    assert!(backend.calls().is_empty());

    let bodies = completion_bodies(&h.upstream, "/chat/completions");
    let offered: Vec<&str> = bodies[0]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["function"]["name"].as_str())
        .collect();
    assert_eq!(offered, vec!["edit_file", "grep"]);
}

#[tokio::test]
async fn test_non_streaming_aggregate() {
    let h = harness(ToolRegistry::empty(), OrchestratorSettings::default());
    h.upstream.push("/chat/completions", text_stream("Hello there"));

    let stream = h.orchestrator.complete(hi(), &CancellationToken::new()).await.unwrap();
    let id = stream.id().to_string();
    let completion = aggregate(stream).await.unwrap();
    assert_eq!(completion.id, id);
    assert_eq!(completion.object, "chat.completion");
    assert_eq!(completion.model, "gpt-4o");
    assert_eq!(completion.choices[0].message.text(), "Hello there");
    assert_eq!(completion.choices[0].finish_reason, Some(FinishReason::Stop));
}

#[tokio::test]
async fn test_responses_models_use_responses_endpoint() {
    let h = harness(ToolRegistry::empty(), OrchestratorSettings::default());
    h.upstream.push(
        "/responses",
        ScriptedReply::stream([
            json!({"type": "response.output_text.delta", "delta": "Hi "}).to_string(),
            json!({"type": "response.output_text.delta", "delta": "there"}).to_string(),
            json!({"type": "response.completed", "response": {}}).to_string(),
        ]),
    );

    let request = ChatCompletionRequest::new("gpt-5-codex", vec![ChatMessage::user("Hi")]);
    let stream = h.orchestrator.complete(request, &CancellationToken::new()).await.unwrap();
    assert_eq!(content_of(&collect(stream).await), "Hi there");
    assert!(h.upstream.requests_to("/chat/completions").is_empty());
    let bodies = completion_bodies(&h.upstream, "/responses");
    assert_eq!(bodies[0]["input"][0]["role"], "user");
}

#[tokio::test]
async fn test_dropping_the_stream_cancels_upstream() {
    let upstream = Arc::new(ScriptedUpstream::new().with_chunk_delay(Duration::from_millis(50)));
    upstream.push("/models", catalog());
    let payloads: Vec<String> = (0..100).map(|i| chunk(json!({"content": i.to_string()}), None)).collect();
    upstream.push("/chat/completions", ScriptedReply::Stream(payloads));
    let credentials = Arc::new(CredentialManager::new(Arc::new(MockExchanger::new())).with_identity("ghu_test"));
    let orchestrator = Orchestrator::new(
        upstream.clone(),
        credentials,
        Arc::new(ToolRegistry::empty()),
        OrchestratorSettings::default(),
    );

    let parent = CancellationToken::new();
    let mut stream = orchestrator.complete(hi(), &parent).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.content(), Some("0"));
    drop(stream);

    // The caller's own token is untouched
    assert!(!parent.is_cancelled());
}

#[tokio::test]
async fn test_models_list() {
    let h = harness(ToolRegistry::empty(), OrchestratorSettings::default());
    let list = h.orchestrator.models(&CancellationToken::new()).await.unwrap();
    let ids: Vec<&str> = list.data.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["gpt-4o", "gpt-5-codex"]);
}
