//! The per-request driver task and the client-facing chunk stream

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::{upstream_error, Conversation, Orchestrator};
use crate::error::{GatewayError, GatewayResult};
use crate::types::{ChatChunk, ChatMessage, Delta, FinishReason, Role, ToolCall, ToolCallAccumulator, ToolCallDelta, ToolResult};
use crate::upstream::{LineStream, UpstreamError, UpstreamEvent};

const CHANNEL_CAPACITY: usize = 64;

/// Chunks for one client request.
///
/// Ends after the chunk carrying the finish reason, or after an error item.
/// Dropping it cancels the request.
#[derive(Debug)]
pub struct CompletionStream {
    id: String,
    model: String,
    rx: mpsc::Receiver<GatewayResult<ChatChunk>>,
    _cancel: DropGuard,
}

impl CompletionStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Stream for CompletionStream {
    type Item = GatewayResult<ChatChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub(super) fn spawn(
    orchestrator: Orchestrator,
    conversation: Conversation,
    lines: LineStream,
    cancel: CancellationToken,
) -> CompletionStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let stream = CompletionStream {
        id: conversation.id.clone(),
        model: conversation.model.clone(),
        rx,
        _cancel: cancel.clone().drop_guard(),
    };
    let driver = Driver {
        orchestrator,
        conversation,
        cancel,
        tx,
        role_sent: false,
    };
    tokio::spawn(driver.run(lines));
    stream
}

/// How one upstream turn ended
enum TurnEnd {
    Finished(FinishReason),
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
        finish: FinishReason,
    },
}

struct Driver {
    orchestrator: Orchestrator,
    conversation: Conversation,
    cancel: CancellationToken,
    tx: mpsc::Sender<GatewayResult<ChatChunk>>,
    role_sent: bool,
}

impl Driver {
    async fn run(mut self, lines: LineStream) {
        match self.drive(lines).await {
            Ok(()) => debug!(id = %self.conversation.id, "completion finished"),
            Err(GatewayError::Cancelled) => info!(id = %self.conversation.id, "completion cancelled"),
            Err(e) => {
                warn!(id = %self.conversation.id, "completion failed: {}", e);
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    async fn drive(&mut self, mut lines: LineStream) -> GatewayResult<()> {
        let mut tool_turns = 0;
        loop {
            let (content, calls, finish) = match self.stream_turn(lines).await? {
                TurnEnd::Finished(reason) => return self.emit(Delta::default(), Some(reason)).await,
                TurnEnd::ToolCalls { content, calls, finish } => (content, calls, finish),
            };

            // Calls from a turn cut short may carry truncated arguments
            let complete = matches!(finish, FinishReason::ToolCalls | FinishReason::Stop);
            let for_client = !complete
                || !self.orchestrator.tools().has_backend()
                || calls.iter().any(|c| self.conversation.client_tools.contains(c.name()));
            if for_client {
                if !complete {
                    warn!(id = %self.conversation.id, "turn ended with {:?}, not dispatching its tool calls", finish);
                }
                let reason = if complete { FinishReason::ToolCalls } else { finish };
                let deltas = calls
                    .iter()
                    .enumerate()
                    .map(|(i, call)| ToolCallDelta::complete(i, call))
                    .collect();
                let delta = Delta {
                    tool_calls: Some(deltas),
                    ..Default::default()
                };
                return self.emit(delta, Some(reason)).await;
            }

            let limit = self.orchestrator.max_tool_turns();
            if tool_turns >= limit {
                return Err(GatewayError::ToolLoopExceeded(limit));
            }
            tool_turns += 1;
            info!(
                id = %self.conversation.id,
                round = tool_turns,
                "dispatching {} tool call(s)",
                calls.len()
            );

            self.conversation
                .messages
                .push(ChatMessage::assistant_tool_calls(content, calls.clone()));
            for call in &calls {
                let result = self.dispatch(call).await?;
                self.conversation
                    .messages
                    .push(ChatMessage::tool(call.id.clone(), result.to_message_text()));
            }

            lines = self
                .orchestrator
                .open_turn(&mut self.conversation, &self.cancel)
                .await?;
        }
    }

    /// Forward content as it arrives and collect tool calls
    async fn stream_turn(&mut self, mut lines: LineStream) -> GatewayResult<TurnEnd> {
        let mut decoder = self.conversation.wire.decoder();
        let mut accumulator = ToolCallAccumulator::new();
        let mut content = String::new();
        let mut finish = None;
        let mut done = false;

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(GatewayError::Cancelled),
                next = lines.next() => next,
            };
            let Some(payload) = next else {
                break;
            };
            let payload = payload.map_err(upstream_error)?;
            let events = match decoder.decode(&payload) {
                Ok(events) => events,
                Err(e) => {
                    warn!("skipping upstream chunk: {}", e);
                    continue;
                }
            };
            for event in events {
                match event {
                    UpstreamEvent::Content(text) => {
                        content.push_str(&text);
                        let delta = Delta {
                            content: Some(text),
                            ..Default::default()
                        };
                        self.emit(delta, None).await?;
                    }
                    UpstreamEvent::ToolCall(delta) => accumulator.push(&delta),
                    UpstreamEvent::Finish(reason) => finish = Some(reason),
                    UpstreamEvent::Error(message) => {
                        return Err(GatewayError::Upstream(UpstreamError::Stream(message)))
                    }
                    UpstreamEvent::Done => {
                        done = true;
                        break 'read;
                    }
                }
            }
        }

        if finish.is_none() && !done {
            return Err(GatewayError::Upstream(UpstreamError::Stream(
                "upstream stream ended before completion".into(),
            )));
        }

        let calls = accumulator.finish();
        if calls.is_empty() {
            return Ok(TurnEnd::Finished(finish.unwrap_or(FinishReason::Stop)));
        }
        Ok(TurnEnd::ToolCalls {
            content: Some(content).filter(|c| !c.is_empty()),
            calls,
            finish: finish.unwrap_or(FinishReason::ToolCalls),
        })
    }

    /// Run one tool call. If the request is cancelled meanwhile the call
    /// keeps running in the background and its result is dropped.
    async fn dispatch(&self, call: &ToolCall) -> GatewayResult<ToolResult> {
        let tools = self.orchestrator.tools().clone();
        let owned = call.clone();
        let task = tokio::spawn(async move { tools.execute_tool_call(&owned).await });
        tokio::select! {
            _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
            joined = task => Ok(joined.unwrap_or_else(|e| ToolResult::error(format!("tool task failed: {}", e)))),
        }
    }

    async fn emit(&mut self, mut delta: Delta, finish: Option<FinishReason>) -> GatewayResult<()> {
        if !self.role_sent {
            delta.role = Some(Role::Assistant);
            self.role_sent = true;
        }
        let mut chunk = ChatChunk::new(
            self.conversation.id.clone(),
            self.conversation.model.clone(),
            self.conversation.created,
            delta,
        );
        if let Some(reason) = finish {
            chunk = chunk.with_finish_reason(reason);
        }
        self.tx.send(Ok(chunk)).await.map_err(|_| GatewayError::Cancelled)
    }
}
