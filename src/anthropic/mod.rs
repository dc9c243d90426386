//! Anthropic Messages API surface: the inbound request model and the
//! outbound SSE event emitter.

pub mod sse;
pub mod types;

pub use sse::{Keepalive, SseEmitter, StopReason};
pub use types::{
    ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Role, SystemPrompt,
    ToolChoice, ToolDefinition, ToolResultContent,
};
