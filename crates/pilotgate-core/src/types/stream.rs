//! Streaming chunk types and tool-call delta accumulation

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::message::Role;
use super::tool::{FunctionCall, ToolCall};

/// Why the model stopped producing output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    #[serde(other)]
    Unknown,
}

/// One `chat.completion.chunk` object.
///
/// Used both for parsing upstream chat-completions streams and for the
/// chunks emitted to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

fn chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Index-addressed fragment of a tool call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ChatChunk {
    /// Build a single-choice chunk
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: u64, delta: Delta) -> Self {
        Self {
            id: id.into(),
            object: chunk_object(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
        }
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        if let Some(choice) = self.choices.first_mut() {
            choice.finish_reason = Some(reason);
        }
        self
    }

    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.choices.first()?.finish_reason.as_ref()
    }
}

impl ToolCallDelta {
    /// A delta carrying a whole call, used when passing calls to the client
    pub fn complete(index: usize, call: &ToolCall) -> Self {
        Self {
            index,
            id: Some(call.id.clone()),
            kind: Some(call.kind.clone()),
            function: Some(FunctionDelta {
                name: Some(call.function.name.clone()),
                arguments: Some(call.function.arguments.clone()),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    /// The name arrived whole, together with the call id
    name_complete: bool,
    arguments: String,
}

/// Accumulates index-addressed tool-call fragments into complete calls.
///
/// The id and name usually arrive on the first fragment of an index and the
/// arguments string is split across the following ones.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &ToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = &delta.function {
            if let Some(name) = function.name.as_deref() {
                // Some backends resend the full name on every fragment
                let resent = entry.name_complete && entry.name == name;
                if !resent {
                    entry.name.push_str(name);
                    if entry.name == name && delta.id.as_deref().is_some_and(|id| !id.is_empty()) {
                        entry.name_complete = true;
                    }
                }
            }
            if let Some(arguments) = function.arguments.as_deref() {
                entry.arguments.push_str(arguments);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drain the accumulated calls in index order. Calls that never
    /// received an id get a generated one.
    pub fn finish(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, partial)| ToolCall {
                id: partial
                    .id
                    .unwrap_or_else(|| format!("call_{}_{}", index, uuid::Uuid::new_v4().simple())),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: partial.name,
                    arguments: partial.arguments,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(str::to_string),
            kind: None,
            function: Some(FunctionDelta {
                name: name.map(str::to_string),
                arguments: args.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_fragmented_arguments_reassemble() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&fragment(0, Some("call_1"), Some("grep"), Some("a")));
        acc.push(&fragment(0, None, None, Some("rg")));
        acc.push(&fragment(0, None, None, Some("s")));

        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "grep");
        assert_eq!(calls[0].function.arguments, "args");
        assert!(acc.is_empty());
    }

    #[test]
    fn test_resent_name_is_not_doubled() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&fragment(0, Some("call_1"), Some("grep"), Some("{}")));
        acc.push(&fragment(0, None, Some("grep"), None));
        assert_eq!(acc.finish()[0].function.name, "grep");
    }

    #[test]
    fn test_split_name_with_repeated_fragment() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&fragment(0, None, Some("a"), None));
        acc.push(&fragment(0, None, Some("a"), Some("{}")));
        assert_eq!(acc.finish()[0].function.name, "aa");

        acc.push(&fragment(0, Some("call_2"), Some("read_"), None));
        acc.push(&fragment(0, None, Some("file"), None));
        assert_eq!(acc.finish()[0].function.name, "read_file");
    }

    #[test]
    fn test_interleaved_indices_keep_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&fragment(1, Some("b"), Some("read"), Some("{\"p\":")));
        acc.push(&fragment(0, Some("a"), Some("grep"), Some("{}")));
        acc.push(&fragment(1, None, None, Some("1}")));

        let calls = acc.finish();
        assert_eq!(calls.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(calls[1].function.arguments, "{\"p\":1}");
    }

    #[test]
    fn test_missing_id_is_generated() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&fragment(0, None, Some("grep"), Some("{}")));
        let calls = acc.finish();
        assert!(calls[0].id.starts_with("call_0_"));
    }

    #[test]
    fn test_parse_upstream_chunk() {
        let raw = r#"{"id":"x","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        let chunk: ChatChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk.content(), Some("Hi"));
        assert!(chunk.finish_reason().is_none());
    }

    #[test]
    fn test_unknown_finish_reason() {
        let raw = r#"{"choices":[{"delta":{},"finish_reason":"something_new"}]}"#;
        let chunk: ChatChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk.finish_reason(), Some(&FinishReason::Unknown));
    }
}
