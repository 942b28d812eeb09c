//! The two upstream request/response shapes
//!
//! The backend serves some models only through `/chat/completions` and others
//! only through `/responses`. [`WireFormat`] selects the request builder and
//! [`StreamDecoder`] the matching stream parser; both normalise to
//! [`UpstreamEvent`] so the orchestrator never sees the difference.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::{extract_error_summary, UpstreamError, UpstreamResult};
use crate::types::{
    ChatChunk, ChatMessage, ContentPart, FinishReason, FunctionDelta, FunctionTool, MessageContent,
    ReasoningEffort, Role, ToolCallDelta,
};

/// Request fields the gateway controls; never copied from the client's extras
const RESERVED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "input",
    "stream",
    "stream_options",
    "tools",
    "reasoning_effort",
    "reasoning",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    ChatCompletions,
    Responses,
}

/// Everything needed to build one upstream request
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [FunctionTool],
    pub effort: Option<ReasoningEffort>,
    pub extra: &'a Map<String, Value>,
}

/// Normalised unit of a streamed upstream response
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Content(String),
    ToolCall(ToolCallDelta),
    Finish(FinishReason),
    /// Backend reported an error inside the stream
    Error(String),
    /// Explicit end-of-stream marker
    Done,
}

impl WireFormat {
    pub fn path(&self) -> &'static str {
        match self {
            WireFormat::ChatCompletions => "/chat/completions",
            WireFormat::Responses => "/responses",
        }
    }

    pub fn build_request(&self, turn: &TurnRequest<'_>) -> Value {
        match self {
            WireFormat::ChatCompletions => build_chat_request(turn),
            WireFormat::Responses => build_responses_request(turn),
        }
    }

    pub fn decoder(&self) -> StreamDecoder {
        match self {
            WireFormat::ChatCompletions => StreamDecoder::Chat,
            WireFormat::Responses => StreamDecoder::Responses(ResponsesState::default()),
        }
    }
}

fn build_chat_request(turn: &TurnRequest<'_>) -> Value {
    let mut body = Map::new();
    for (key, value) in turn.extra {
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            body.insert(key.clone(), value.clone());
        }
    }
    body.insert("model".into(), json!(turn.model));
    body.insert("messages".into(), json!(turn.messages));
    body.insert("stream".into(), json!(true));
    if !turn.tools.is_empty() {
        body.insert("tools".into(), json!(turn.tools));
    }
    if let Some(effort) = turn.effort {
        body.insert("reasoning_effort".into(), json!(effort.as_str()));
    }
    Value::Object(body)
}

fn build_responses_request(turn: &TurnRequest<'_>) -> Value {
    let mut body = Map::new();
    for key in ["temperature", "top_p", "user"] {
        if let Some(value) = turn.extra.get(key) {
            body.insert(key.into(), value.clone());
        }
    }
    if let Some(max) = turn.extra.get("max_completion_tokens").or_else(|| turn.extra.get("max_tokens")) {
        body.insert("max_output_tokens".into(), max.clone());
    }
    body.insert("model".into(), json!(turn.model));
    body.insert("input".into(), Value::Array(responses_input(turn.messages)));
    body.insert("stream".into(), json!(true));
    if !turn.tools.is_empty() {
        let tools: Vec<Value> = turn
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.function.name,
                    "description": t.function.description,
                    "parameters": t.function.parameters.clone().unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
    }
    if let Some(effort) = turn.effort {
        body.insert("reasoning".into(), json!({ "effort": effort.as_str() }));
    }
    Value::Object(body)
}

fn responses_input(messages: &[ChatMessage]) -> Vec<Value> {
    let mut input = Vec::new();
    for msg in messages {
        match msg.role {
            Role::Tool => input.push(json!({
                "type": "function_call_output",
                "call_id": msg.tool_call_id.clone().unwrap_or_default(),
                "output": msg.text(),
            })),
            Role::Assistant => {
                let text = msg.text();
                if !text.is_empty() {
                    input.push(json!({ "role": "assistant", "content": text }));
                }
                for call in msg.tool_calls.iter().flatten() {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.function.name,
                        "arguments": call.function.arguments,
                    }));
                }
            }
            role => input.push(json!({
                "role": role.to_string(),
                "content": responses_content(msg.content.as_ref()),
            })),
        }
    }
    input
}

fn responses_content(content: Option<&MessageContent>) -> Value {
    match content {
        None => json!(""),
        Some(MessageContent::Text(text)) => json!(text),
        Some(MessageContent::Parts(parts)) => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({ "type": "input_text", "text": text }),
                    ContentPart::ImageUrl { image_url } => {
                        let url = image_url.get("url").cloned().unwrap_or_else(|| image_url.clone());
                        json!({ "type": "input_image", "image_url": url })
                    }
                })
                .collect(),
        ),
    }
}

/// Per-stream parser state, selected by [`WireFormat::decoder`]
#[derive(Debug)]
pub enum StreamDecoder {
    Chat,
    Responses(ResponsesState),
}

#[derive(Debug, Default)]
pub struct ResponsesState {
    /// `output_index` of each function-call item -> tool-call index
    call_indices: HashMap<u64, usize>,
}

impl StreamDecoder {
    /// Decode one `data:` payload. An `Err` means this payload alone is
    /// unusable; the caller skips it and keeps reading.
    pub fn decode(&mut self, payload: &str) -> UpstreamResult<Vec<UpstreamEvent>> {
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(vec![UpstreamEvent::Done]);
        }
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| UpstreamError::MalformedChunk(format!("{}: {}", e, truncate(payload))))?;
        match self {
            StreamDecoder::Chat => decode_chat(value),
            StreamDecoder::Responses(state) => Ok(state.decode(value)),
        }
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(120).collect()
}

fn decode_chat(value: Value) -> UpstreamResult<Vec<UpstreamEvent>> {
    if value.get("error").is_some() {
        let message = extract_error_summary(&value).unwrap_or_else(|| value.to_string());
        return Ok(vec![UpstreamEvent::Error(message)]);
    }
    let chunk: ChatChunk =
        serde_json::from_value(value).map_err(|e| UpstreamError::MalformedChunk(e.to_string()))?;

    let mut events = Vec::new();
    // Usage-only chunks carry no choices
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(events);
    };
    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
        events.push(UpstreamEvent::Content(content));
    }
    for delta in choice.delta.tool_calls.into_iter().flatten() {
        events.push(UpstreamEvent::ToolCall(delta));
    }
    if let Some(reason) = choice.finish_reason {
        events.push(UpstreamEvent::Finish(reason));
    }
    Ok(events)
}

impl ResponsesState {
    fn decode(&mut self, value: Value) -> Vec<UpstreamEvent> {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "response.output_text.delta" => value
                .get("delta")
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
                .map(|d| vec![UpstreamEvent::Content(d.to_string())])
                .unwrap_or_default(),
            "response.output_item.added" => {
                let item = value.get("item").cloned().unwrap_or_default();
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return Vec::new();
                }
                let output_index = value.get("output_index").and_then(Value::as_u64).unwrap_or_default();
                let index = self.call_indices.len();
                self.call_indices.insert(output_index, index);
                let arguments = item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string);
                vec![UpstreamEvent::ToolCall(ToolCallDelta {
                    index,
                    id: item.get("call_id").and_then(Value::as_str).map(str::to_string),
                    kind: Some("function".to_string()),
                    function: Some(FunctionDelta {
                        name: item.get("name").and_then(Value::as_str).map(str::to_string),
                        arguments,
                    }),
                })]
            }
            "response.function_call_arguments.delta" => {
                let output_index = value.get("output_index").and_then(Value::as_u64).unwrap_or_default();
                let Some(&index) = self.call_indices.get(&output_index) else {
                    tracing::warn!("arguments delta for unknown output index {}", output_index);
                    return Vec::new();
                };
                let delta = value.get("delta").and_then(Value::as_str).unwrap_or_default();
                vec![UpstreamEvent::ToolCall(ToolCallDelta {
                    index,
                    id: None,
                    kind: None,
                    function: Some(FunctionDelta {
                        name: None,
                        arguments: Some(delta.to_string()),
                    }),
                })]
            }
            "response.completed" => {
                let reason = if self.call_indices.is_empty() {
                    FinishReason::Stop
                } else {
                    FinishReason::ToolCalls
                };
                vec![UpstreamEvent::Finish(reason)]
            }
            "response.incomplete" => vec![UpstreamEvent::Finish(FinishReason::Length)],
            "response.failed" => {
                let message = value
                    .pointer("/response/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("response failed")
                    .to_string();
                vec![UpstreamEvent::Error(message)]
            }
            "error" => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| extract_error_summary(&value))
                    .unwrap_or_else(|| "upstream error".to_string());
                vec![UpstreamEvent::Error(message)]
            }
            _ => Vec::new(),
        }
    }
}
