//! Fold a completion stream into one `chat.completion` object

use futures::StreamExt;

use super::stream::CompletionStream;
use crate::error::GatewayResult;
use crate::types::{ChatCompletion, ChatMessage, CompletionChoice, ToolCallAccumulator};

/// Drain `stream` for a non-streaming client. The first error wins.
pub async fn aggregate(mut stream: CompletionStream) -> GatewayResult<ChatCompletion> {
    let mut content = String::new();
    let mut calls = ToolCallAccumulator::new();
    let mut finish_reason = None;
    let mut created = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        created = chunk.created;
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                content.push_str(&text);
            }
            for delta in choice.delta.tool_calls.iter().flatten() {
                calls.push(delta);
            }
            if choice.finish_reason.is_some() {
                finish_reason = choice.finish_reason;
            }
        }
    }

    let message = if calls.is_empty() {
        ChatMessage::assistant(content)
    } else {
        ChatMessage::assistant_tool_calls(Some(content).filter(|c| !c.is_empty()), calls.finish())
    };
    Ok(ChatCompletion {
        id: stream.id().to_string(),
        object: "chat.completion".to_string(),
        created,
        model: stream.model().to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message,
            finish_reason,
        }],
    })
}
