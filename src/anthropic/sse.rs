//! Anthropic SSE emission.
//!
//! Handlers translate upstream chunks into calls on [`SseEmitter`], which
//! guarantees the event sequence a Messages API consumer expects: one
//! `message_start`, well-nested content-block groups with densely assigned
//! indices, one `message_delta` carrying the stop reason and real output
//! tokens, one `message_stop`, then `[DONE]`. A mid-stream upstream failure
//! turns into a terminal `error` event instead of the closing pair.
//!
//! Each frame is two ASCII lines, `event: <name>` and `data: <compact JSON>`,
//! followed by a blank line, written as a whole [`Bytes`] message into an
//! mpsc channel; the server turns the receiver into the response body.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ProxyError, Result};

/// Placeholder usage carried by `message_start`; real totals arrive in the
/// trailing `message_delta`. Some clients pre-allocate buffers from these.
const PLACEHOLDER_INPUT_TOKENS: u64 = 100;
const PLACEHOLDER_OUTPUT_TOKENS: u64 = 1;

/// Idle threshold before the keepalive task injects a `ping`.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(1);
/// How often the keepalive task checks for idleness.
const KEEPALIVE_TICK: Duration = Duration::from_millis(250);

/// Why the assistant turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
    ToolUse,
}

/// Stateful writer for one response's Anthropic event sequence.
pub struct SseEmitter {
    tx: mpsc::Sender<Bytes>,
    last_emit: Arc<Mutex<Instant>>,
    next_index: usize,
    open_block: Option<BlockKind>,
    started: bool,
    finished: bool,
}

impl SseEmitter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            last_emit: Arc::new(Mutex::new(Instant::now())),
            next_index: 0,
            open_block: None,
            started: false,
            finished: false,
        }
    }

    async fn send(&self, event: &str, data: serde_json::Value) -> Result<()> {
        let frame = format!("event: {event}\ndata: {data}\n\n");
        self.touch();
        self.tx
            .send(Bytes::from(frame))
            .await
            .map_err(|_| ProxyError::Internal("client disconnected".into()))
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_emit.lock() {
            *last = Instant::now();
        }
    }

    /// Open the stream: `message_start` with placeholder usage, then a ping.
    pub async fn message_start(&mut self, model: &str) -> Result<()> {
        self.started = true;
        let id = format!("msg_{}", Uuid::new_v4().simple());
        self.send(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {
                        "input_tokens": PLACEHOLDER_INPUT_TOKENS,
                        "output_tokens": PLACEHOLDER_OUTPUT_TOKENS
                    }
                }
            }),
        )
        .await?;
        self.ping().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send("ping", json!({"type": "ping"})).await
    }

    async fn open(&mut self, kind: BlockKind, content_block: serde_json::Value) -> Result<()> {
        if self.open_block.is_some() {
            self.close_block().await?;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.open_block = Some(kind);
        self.send(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": content_block
            }),
        )
        .await
    }

    /// Close the currently open block, if any.
    pub async fn close_block(&mut self) -> Result<()> {
        if self.open_block.take().is_some() {
            let index = self.next_index - 1;
            self.send(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            )
            .await?;
        }
        Ok(())
    }

    async fn delta(&self, delta: serde_json::Value) -> Result<()> {
        let index = self.next_index - 1;
        self.send(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": index, "delta": delta}),
        )
        .await
    }

    /// Append thinking text, opening a thinking block as needed.
    pub async fn thinking_delta(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        if self.open_block != Some(BlockKind::Thinking) {
            self.open(BlockKind::Thinking, json!({"type": "thinking", "thinking": ""}))
                .await?;
        }
        self.delta(json!({"type": "thinking_delta", "thinking": text}))
            .await
    }

    /// Append response text, opening a text block as needed.
    pub async fn text_delta(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        if self.open_block != Some(BlockKind::Text) {
            self.open(BlockKind::Text, json!({"type": "text", "text": ""}))
                .await?;
        }
        self.delta(json!({"type": "text_delta", "text": text})).await
    }

    /// Start a tool-use block. Any open block is closed first; tool blocks
    /// never nest.
    pub async fn tool_use_start(&mut self, id: &str, name: &str) -> Result<()> {
        self.open(
            BlockKind::ToolUse,
            json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
        )
        .await
    }

    /// Append a fragment of the tool call's JSON arguments.
    pub async fn tool_args_delta(&mut self, partial_json: &str) -> Result<()> {
        if self.open_block != Some(BlockKind::ToolUse) {
            log::debug!("[SSE] dropping tool args outside a tool_use block");
            return Ok(());
        }
        self.delta(json!({"type": "input_json_delta", "partial_json": partial_json}))
            .await
    }

    /// Close the stream normally: remaining block, `message_delta` with the
    /// real usage, `message_stop`, `[DONE]`.
    pub async fn finish(&mut self, stop_reason: StopReason, output_tokens: u64) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.close_block().await?;
        self.send(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason.as_str(), "stop_sequence": null},
                "usage": {"output_tokens": output_tokens}
            }),
        )
        .await?;
        self.send("message_stop", json!({"type": "message_stop"}))
            .await?;
        self.touch();
        self.tx
            .send(Bytes::from_static(b"data: [DONE]\n\n"))
            .await
            .map_err(|_| ProxyError::Internal("client disconnected".into()))
    }

    /// Terminate the stream with an `error` event in place of the normal
    /// closing pair.
    pub async fn fail(&mut self, err: &ProxyError) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.close_block().await?;
        self.send(
            "error",
            json!({
                "type": "error",
                "error": {"type": err.error_type(), "message": err.to_string()}
            }),
        )
        .await
    }

    /// Whether the terminal event has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Spawn the keepalive task: a `ping` after every ~1 s of stream
    /// silence. The task dies with the returned guard.
    pub fn spawn_keepalive(&self) -> Keepalive {
        let tx = self.tx.clone();
        let last_emit = Arc::clone(&self.last_emit);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(KEEPALIVE_TICK).await;
                let idle = last_emit
                    .lock()
                    .map(|last| last.elapsed() >= KEEPALIVE_IDLE)
                    .unwrap_or(false);
                if idle {
                    let frame = format!("event: ping\ndata: {}\n\n", json!({"type": "ping"}));
                    if tx.send(Bytes::from(frame)).await.is_err() {
                        return;
                    }
                    if let Ok(mut last) = last_emit.lock() {
                        *last = Instant::now();
                    }
                }
            }
        });
        Keepalive { handle }
    }
}

/// Guard for the keepalive task; aborts it when dropped.
pub struct Keepalive {
    handle: JoinHandle<()>,
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
