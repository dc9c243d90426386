//! OllamaCloud native chat handler.
//!
//! OllamaCloud's `/api/chat` is not SSE: the response body is one JSON
//! object per line, `{"message":{"content":…}}` chunks followed by a
//! terminal `{"done":true,…}` carrying `prompt_eval_count`/`eval_count`.
//! The payload is the minimal `{model, messages, stream}` shape — no vision,
//! no structured tool calling — so images are dropped and tool traffic is
//! inlined as plain text.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::anthropic::{ContentBlock, MessagesRequest, Role, SseEmitter, StopReason};
use crate::error::{ProxyError, Result};
use crate::model::resolver::Resolution;
use crate::usage::SessionUsage;

use super::translate::neutralize_identity;
use super::{send_upstream, sse_channel, HandlerContext, UpstreamHandler};

/// Handler for the Ollama-native chat protocol.
pub struct OllamaHandler {
    client: reqwest::Client,
    usage: Arc<SessionUsage>,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OllamaHandler {
    pub fn new(resolution: &Resolution, ctx: &HandlerContext) -> Self {
        Self {
            client: ctx.client.clone(),
            usage: Arc::new(SessionUsage::new(
                ctx.pricing.clone(),
                &resolution.provider,
                "OllamaCloud",
                &resolution.model_name,
                ctx.port,
                ctx.usage_dir.clone(),
                ctx.config.billing.context_drop_threshold,
            )),
            base_url: ctx
                .config
                .base_urls
                .ollamacloud
                .clone()
                .unwrap_or_else(|| "https://ollama.com".into()),
            api_key: ctx.credential_value(&resolution.provider),
            model: resolution.model_name.clone(),
        }
    }

    /// Build the native chat payload.
    pub(crate) fn build_body(&self, request: &MessagesRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = request.system_text() {
            messages.push(json!({
                "role": "system",
                "content": neutralize_identity(&system, &self.model),
            }));
        }
        for message in &request.messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let text = flatten_content(message);
            if !text.is_empty() {
                messages.push(json!({"role": role, "content": text}));
            }
        }
        json!({"model": self.model, "messages": messages, "stream": true})
    }
}

/// Render a message as plain text: tool traffic inlined, images dropped.
fn flatten_content(message: &crate::anthropic::Message) -> String {
    let mut out = String::new();
    for block in message.content.blocks() {
        match block {
            ContentBlock::Text { text } => out.push_str(&text),
            ContentBlock::ToolUse { name, input, .. } => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("[Tool Call] {name}({input})"));
            }
            ContentBlock::ToolResult { content, .. } => {
                if !out.is_empty() {
                    out.push('\n');
                }
                let text = content.map(|c| c.text()).unwrap_or_default();
                out.push_str(&format!("[Tool Result]: {text}"));
            }
            ContentBlock::Image { .. } | ContentBlock::Thinking { .. } => {}
        }
    }
    out
}

#[async_trait]
impl UpstreamHandler for OllamaHandler {
    async fn handle(&self, request: MessagesRequest) -> Result<Response> {
        let body = self.build_body(&request);
        log::debug!("[Ollama] {} -> {}/api/chat", self.model, self.base_url);

        let mut builder = self
            .client
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let upstream = send_upstream(builder.json(&body)).await?;

        let (tx, response) = sse_channel();
        let mut emitter = SseEmitter::new(tx);
        let model = self.model.clone();
        let usage = Arc::clone(&self.usage);

        tokio::spawn(async move {
            let _keepalive = emitter.spawn_keepalive();
            if emitter.message_start(&model).await.is_err() {
                return;
            }

            let mut state = OllamaStreamState::default();
            let mut buffer = String::new();
            let mut bytes = upstream.bytes_stream();
            'stream: while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(line) = next_line(&mut buffer) {
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(&line) {
                                Ok(parsed) => {
                                    match apply_line(&mut emitter, &mut state, &parsed).await {
                                        Ok(true) => break 'stream,
                                        Ok(false) => {}
                                        Err(_) => return,
                                    }
                                }
                                Err(err) => {
                                    log::debug!("[Ollama] unparseable line: {err}");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        if state.done {
                            usage.record_absolute(state.prompt_tokens, state.eval_tokens);
                        } else {
                            usage.flush();
                        }
                        let err = ProxyError::Network(format!("upstream stream failed: {err}"));
                        let _ = emitter.fail(&err).await;
                        return;
                    }
                }
            }

            if state.done {
                usage.record_absolute(state.prompt_tokens, state.eval_tokens);
            } else {
                usage.flush();
            }
            let _ = emitter
                .finish(StopReason::EndTurn, state.eval_tokens)
                .await;
        });

        Ok(response)
    }

    async fn shutdown(&self) {
        self.usage.flush();
    }
}

/// Pop one complete line from the buffer, if present.
fn next_line(buffer: &mut String) -> Option<String> {
    let idx = buffer.find('\n')?;
    let line = buffer[..idx].trim().to_string();
    buffer.drain(..=idx);
    Some(line)
}

// ─── Stream state ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct OllamaStreamState {
    pub prompt_tokens: u64,
    pub eval_tokens: u64,
    pub done: bool,
}

/// Fold one response line into the emitter. Returns `true` on the terminal
/// `done` line.
pub(crate) async fn apply_line(
    emitter: &mut SseEmitter,
    state: &mut OllamaStreamState,
    line: &Value,
) -> Result<bool> {
    if line["done"].as_bool() == Some(true) {
        state.done = true;
        if let Some(prompt) = line["prompt_eval_count"].as_u64() {
            state.prompt_tokens = prompt;
        }
        if let Some(eval) = line["eval_count"].as_u64() {
            state.eval_tokens = eval;
        }
        return Ok(true);
    }
    if let Some(text) = line["message"]["content"].as_str() {
        emitter.text_delta(text).await?;
    }
    Ok(false)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
