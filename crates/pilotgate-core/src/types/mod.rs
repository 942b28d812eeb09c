//! Core types shared by the gateway
//!
//! Message, tool and chunk types follow the OpenAI chat-completions wire
//! shape, which is what the IDE client speaks.

mod message;
mod model;
mod request;
mod stream;
mod tool;

pub use message::{ChatMessage, ContentPart, MessageContent, Role};
pub use model::{ModelEntry, ModelList, ReasoningEffort};
pub use request::{ChatCompletion, ChatCompletionRequest, CompletionChoice};
pub use stream::{ChatChunk, ChunkChoice, Delta, FinishReason, FunctionDelta, ToolCallAccumulator, ToolCallDelta};
pub use tool::{FunctionCall, FunctionDefinition, FunctionTool, ToolCall, ToolDescriptor, ToolResult};
