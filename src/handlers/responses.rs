//! OpenAI Responses API handler.
//!
//! Used for OpenAI `codex` models, which are only served through
//! `/v1/responses`. The request shape differs from Chat Completions in two
//! ways that matter here: conversation turns become typed input items
//! (`input_text`/`output_text`/`input_image`), and tool traffic is top-level
//! — assistant calls are `function_call` items, results are
//! `function_call_output` items.
//!
//! A streamed function call carries two identifiers: the output item id
//! (`fc_…`), which keys argument deltas, and the call id (`call_…`), which
//! keys the eventual tool result. Both map to one Anthropic id
//! (`toolu_<stripped call id>`), stored under both keys so every event finds
//! its block.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::anthropic::{ContentBlock, MessagesRequest, Role, SseEmitter, StopReason};
use crate::error::{ProxyError, Result};
use crate::model::resolver::Resolution;
use crate::usage::SessionUsage;

use super::translate::{neutralize_identity, openai_reasoning_effort};
use super::{new_tool_id, send_upstream, sse_channel, HandlerContext, UpstreamHandler};

/// The Responses API rejects `max_output_tokens` below this.
const MIN_OUTPUT_TOKENS: u32 = 16;

/// Handler for `/v1/responses`.
pub struct ResponsesHandler {
    client: reqwest::Client,
    usage: Arc<SessionUsage>,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl ResponsesHandler {
    pub fn new(resolution: &Resolution, ctx: &HandlerContext) -> Self {
        Self {
            client: ctx.client.clone(),
            usage: Arc::new(SessionUsage::new(
                ctx.pricing.clone(),
                &resolution.provider,
                &resolution.provider_name,
                &resolution.model_name,
                ctx.port,
                ctx.usage_dir.clone(),
                ctx.config.billing.context_drop_threshold,
            )),
            base_url: ctx
                .config
                .base_urls
                .openai
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            api_key: ctx.credential_value(&resolution.provider),
            model: resolution.model_name.clone(),
        }
    }

    /// Build the Responses request body.
    pub(crate) fn build_body(&self, request: &MessagesRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "input": input_items(request),
            "stream": true,
        });

        if let Some(system) = request.system_text() {
            body["instructions"] = json!(neutralize_identity(&system, &self.model));
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_output_tokens"] = json!(max_tokens.max(MIN_OUTPUT_TOKENS));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(budget) = request.thinking_budget() {
            body["reasoning"] = json!({
                "effort": openai_reasoning_effort(budget),
                "summary": "auto",
            });
        }
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                let declarations: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "name": tool.name,
                            "description": tool.description.clone().unwrap_or_default(),
                            "parameters": tool.input_schema,
                        })
                    })
                    .collect();
                body["tools"] = json!(declarations);
                if let Some(choice) = &request.tool_choice {
                    body["tool_choice"] = match choice {
                        crate::anthropic::ToolChoice::Auto => json!("auto"),
                        crate::anthropic::ToolChoice::Any => json!("required"),
                        crate::anthropic::ToolChoice::None => json!("none"),
                        crate::anthropic::ToolChoice::Tool { name } => {
                            json!({"type": "function", "name": name})
                        }
                    };
                }
            }
        }

        body
    }
}

/// Recover the upstream call id from an Anthropic tool id minted by this
/// handler (`toolu_XYZ` ⇄ `call_XYZ`).
fn upstream_call_id(tool_use_id: &str) -> String {
    match tool_use_id.strip_prefix("toolu_") {
        Some(stripped) => format!("call_{stripped}"),
        None => tool_use_id.to_string(),
    }
}

/// Anthropic id for an upstream call id (`call_XYZ` → `toolu_XYZ`).
fn anthropic_tool_id(call_id: &str) -> String {
    match call_id.strip_prefix("call_") {
        Some(stripped) => format!("toolu_{stripped}"),
        None => new_tool_id(),
    }
}

/// Rewrite the conversation into Responses input items.
fn input_items(request: &MessagesRequest) -> Vec<Value> {
    let mut items = Vec::new();
    for message in &request.messages {
        let (role, text_type) = match message.role {
            Role::User => ("user", "input_text"),
            Role::Assistant => ("assistant", "output_text"),
        };

        let mut content: Vec<Value> = Vec::new();
        let flush = |items: &mut Vec<Value>, content: &mut Vec<Value>| {
            if !content.is_empty() {
                items.push(json!({"role": role, "content": std::mem::take(content)}));
            }
        };

        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text } => {
                    content.push(json!({"type": text_type, "text": text}));
                }
                ContentBlock::Image { source } => {
                    if let Some(url) = source.as_url() {
                        content.push(json!({"type": "input_image", "image_url": url}));
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    flush(&mut items, &mut content);
                    items.push(json!({
                        "type": "function_call",
                        "call_id": upstream_call_id(&id),
                        "name": name,
                        "arguments": input.to_string(),
                        "status": "completed",
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content: result,
                    ..
                } => {
                    flush(&mut items, &mut content);
                    items.push(json!({
                        "type": "function_call_output",
                        "call_id": upstream_call_id(&tool_use_id),
                        "output": result.map(|c| c.text()).unwrap_or_default(),
                    }));
                }
                ContentBlock::Thinking { .. } => {}
            }
        }
        flush(&mut items, &mut content);
    }
    items
}

#[async_trait]
impl UpstreamHandler for ResponsesHandler {
    async fn handle(&self, request: MessagesRequest) -> Result<Response> {
        let body = self.build_body(&request);
        log::debug!(
            "[Responses] {} ({} input items)",
            self.model,
            body["input"].as_array().map(Vec::len).unwrap_or(0)
        );

        let mut builder = self
            .client
            .post(format!("{}/responses", self.base_url))
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

            let mut state = ResponsesStreamState::default();
            let mut events = upstream.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data.trim() == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<Value>(&event.data) {
                            Ok(payload) => {
                                match apply_event(&mut emitter, &mut state, &payload).await {
                                    Ok(true) => break,
                                    Ok(false) => {}
                                    Err(_) => return,
                                }
                            }
                            Err(err) => log::debug!("[Responses] unparseable event: {err}"),
                        }
                    }
                    Err(err) => {
                        record_usage(&usage, &state);
                        let err = ProxyError::Network(format!("upstream stream failed: {err}"));
                        let _ = emitter.fail(&err).await;
                        return;
                    }
                }
            }

            record_usage(&usage, &state);
            let _ = emitter
                .finish(state.stop_reason(), state.output_tokens)
                .await;
        });

        Ok(response)
    }

    async fn shutdown(&self) {
        self.usage.flush();
    }
}

fn record_usage(usage: &SessionUsage, state: &ResponsesStreamState) {
    if state.saw_usage {
        usage.record_incremental(state.input_tokens, state.output_tokens);
    } else {
        usage.flush();
    }
}

// ─── Stream state ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct ResponsesStreamState {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub saw_usage: bool,
    pub emitted_tool: bool,
    pub incomplete: bool,
    /// Both upstream ids (`fc_…` and `call_…`) of every seen call map to its
    /// Anthropic id.
    id_map: HashMap<String, String>,
    /// Anthropic id of the function call currently streaming arguments.
    open_tool: Option<String>,
}

impl ResponsesStreamState {
    pub fn stop_reason(&self) -> StopReason {
        if self.emitted_tool {
            StopReason::ToolUse
        } else if self.incomplete {
            StopReason::MaxTokens
        } else {
            StopReason::EndTurn
        }
    }
}

/// Fold one Responses stream event into the emitter. Returns `true` when the
/// stream is complete.
pub(crate) async fn apply_event(
    emitter: &mut SseEmitter,
    state: &mut ResponsesStreamState,
    payload: &Value,
) -> Result<bool> {
    let kind = payload["type"].as_str().unwrap_or_default();
    match kind {
        "response.output_text.delta" => {
            if let Some(text) = payload["delta"].as_str() {
                emitter.text_delta(text).await?;
            }
        }
        "response.reasoning_summary_text.delta" => {
            if let Some(text) = payload["delta"].as_str() {
                emitter.thinking_delta(text).await?;
            }
        }
        "response.output_item.added" => {
            let item = &payload["item"];
            if item["type"].as_str() == Some("function_call") {
                let call_id = item["call_id"].as_str().unwrap_or_default();
                let tool_id = anthropic_tool_id(call_id);
                if let Some(item_id) = item["id"].as_str() {
                    state.id_map.insert(item_id.to_string(), tool_id.clone());
                }
                if !call_id.is_empty() {
                    state.id_map.insert(call_id.to_string(), tool_id.clone());
                }
                let name = item["name"].as_str().unwrap_or_default();
                state.emitted_tool = true;
                state.open_tool = Some(tool_id.clone());
                emitter.tool_use_start(&tool_id, name).await?;
            }
        }
        "response.function_call_arguments.delta" => {
            let item_id = payload["item_id"].as_str().unwrap_or_default();
            let bound = state.id_map.get(item_id);
            match (bound, &state.open_tool) {
                (Some(tool_id), Some(open)) if tool_id == open => {
                    if let Some(delta) = payload["delta"].as_str() {
                        emitter.tool_args_delta(delta).await?;
                    }
                }
                _ => log::debug!("[Responses] argument delta for unknown item {item_id}"),
            }
        }
        "response.output_item.done" => {
            let item = &payload["item"];
            if item["type"].as_str() == Some("function_call") {
                state.open_tool = None;
                emitter.close_block().await?;
            }
        }
        "response.completed" | "response.done" | "response.incomplete" => {
            if kind == "response.incomplete" {
                state.incomplete = true;
            }
            // `response.incomplete` does not always carry usage; the last
            // known totals stand in that case.
            let usage = &payload["response"]["usage"];
            if let Some(input) = usage["input_tokens"].as_u64() {
                state.input_tokens = input;
                state.saw_usage = true;
            }
            if let Some(output) = usage["output_tokens"].as_u64() {
                state.output_tokens = output;
            }
            return Ok(true);
        }
        _ => {}
    }
    Ok(false)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn collect(rx: &mut mpsc::Receiver<Bytes>) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let text = std::str::from_utf8(&frame).unwrap();
            if text.starts_with("data: [DONE]") {
                out.push(("done".into(), Value::Null));
                continue;
            }
            let mut lines = text.lines();
            let event = lines
                .next()
                .and_then(|l| l.strip_prefix("event: "))
                .unwrap()
                .to_string();
            let data =
                serde_json::from_str(lines.next().and_then(|l| l.strip_prefix("data: ")).unwrap())
                    .unwrap();
            out.push((event, data));
        }
        out
    }

    // ── Id mapping ────────────────────────────────────────────────────────

    #[test]
    fn call_ids_round_trip() {
        assert_eq!(anthropic_tool_id("call_XYZ"), "toolu_XYZ");
        assert_eq!(upstream_call_id("toolu_XYZ"), "call_XYZ");
        // Foreign ids survive the reverse direction untouched.
        assert_eq!(upstream_call_id("call_other"), "call_other");
    }

    /// Argument deltas keyed by the `fc_…` item id bind to the block whose
    /// Anthropic id came from the `call_…` id.
    #[tokio::test]
    async fn double_identity_binds_argument_deltas() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut emitter = SseEmitter::new(tx);
        let mut state = ResponsesStreamState::default();

        emitter.message_start("gpt-5.1-codex").await.unwrap();
        apply_event(
            &mut emitter,
            &mut state,
            &json!({"type": "response.output_item.added", "item": {
                "type": "function_call", "id": "fc_ABC", "call_id": "call_XYZ", "name": "search"
            }}),
        )
        .await
        .unwrap();
        apply_event(
            &mut emitter,
            &mut state,
            &json!({"type": "response.function_call_arguments.delta",
                    "item_id": "fc_ABC", "delta": "{\"q\":\"x\"}"}),
        )
        .await
        .unwrap();
        apply_event(
            &mut emitter,
            &mut state,
            &json!({"type": "response.output_item.done", "item": {"type": "function_call"}}),
        )
        .await
        .unwrap();
        let done = apply_event(
            &mut emitter,
            &mut state,
            &json!({"type": "response.completed", "response": {
                "usage": {"input_tokens": 20, "output_tokens": 4}
            }}),
        )
        .await
        .unwrap();
        assert!(done);
        emitter
            .finish(state.stop_reason(), state.output_tokens)
            .await
            .unwrap();

        let events = collect(&mut rx);
        let start = events
            .iter()
            .find(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d)
            .unwrap();
        assert_eq!(start["content_block"]["id"], "toolu_XYZ");
        assert_eq!(start["content_block"]["name"], "search");

        let args = events
            .iter()
            .find(|(e, _)| e == "content_block_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap())
            .unwrap();
        assert_eq!(args, "{\"q\":\"x\"}");

        assert_eq!(state.stop_reason(), StopReason::ToolUse);
        assert_eq!((state.input_tokens, state.output_tokens), (20, 4));
    }

    /// `response.incomplete` without a usage block still terminates cleanly
    /// with whatever totals were last known.
    #[tokio::test]
    async fn incomplete_without_usage_keeps_last_known() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut emitter = SseEmitter::new(tx);
        let mut state = ResponsesStreamState::default();

        emitter.message_start("gpt-5.1-codex").await.unwrap();
        apply_event(
            &mut emitter,
            &mut state,
            &json!({"type": "response.output_text.delta", "delta": "truncat"}),
        )
        .await
        .unwrap();
        let done = apply_event(
            &mut emitter,
            &mut state,
            &json!({"type": "response.incomplete", "response": {}}),
        )
        .await
        .unwrap();
        assert!(done);
        emitter
            .finish(state.stop_reason(), state.output_tokens)
            .await
            .unwrap();

        assert!(!state.saw_usage);
        let events = collect(&mut rx);
        let names: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
        assert!(names.contains(&"message_delta"));
        assert!(names.contains(&"message_stop"));
        let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "max_tokens");
    }

    #[tokio::test]
    async fn reasoning_summary_becomes_thinking() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut emitter = SseEmitter::new(tx);
        let mut state = ResponsesStreamState::default();

        emitter.message_start("gpt-5.1-codex").await.unwrap();
        apply_event(
            &mut emitter,
            &mut state,
            &json!({"type": "response.reasoning_summary_text.delta", "delta": "plan"}),
        )
        .await
        .unwrap();
        apply_event(
            &mut emitter,
            &mut state,
            &json!({"type": "response.output_text.delta", "delta": "done"}),
        )
        .await
        .unwrap();
        emitter.finish(StopReason::EndTurn, 1).await.unwrap();

        let kinds: Vec<String> = collect(&mut rx)
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d["content_block"]["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["thinking", "text"]);
    }

    // ── Request building ──────────────────────────────────────────────────

    #[test]
    fn items_rewrite() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "gpt-5.1-codex",
            "system": "Be helpful.",
            "max_tokens": 4,
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "look at this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AA"}}
                ]},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Calling the tool."},
                    {"type": "tool_use", "id": "toolu_XYZ", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_XYZ", "content": "found it"}
                ]}
            ]
        }))
        .unwrap();

        let handler = test_handler();
        let body = handler.build_body(&request);

        assert_eq!(body["instructions"], "Be helpful.");
        // Floor applies to tiny budgets.
        assert_eq!(body["max_output_tokens"], 16);

        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0]["role"], "user");
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[0]["content"][1]["type"], "input_image");
        assert_eq!(
            input[0]["content"][1]["image_url"],
            "data:image/png;base64,AA"
        );

        assert_eq!(input[1]["content"][0]["type"], "output_text");

        assert_eq!(input[2]["type"], "function_call");
        assert_eq!(input[2]["call_id"], "call_XYZ");
        assert_eq!(input[2]["status"], "completed");

        assert_eq!(input[3]["type"], "function_call_output");
        assert_eq!(input[3]["call_id"], "call_XYZ");
        assert_eq!(input[3]["output"], "found it");
    }

    fn test_handler() -> ResponsesHandler {
        let ctx = HandlerContext {
            client: reqwest::Client::new(),
            local_queue: crate::queue::LocalQueue::new(1, true),
            gemini_queue: crate::queue::GeminiQueue::with_delays(1, 10),
            pricing: Arc::new(crate::pricing::PricingRegistry::new()),
            credentials: Arc::new(crate::model::MapCredentials::new(&[(
                "OPENAI_API_KEY",
                "k",
            )])),
            config: Arc::new(crate::config::ProxyConfig::default()),
            usage_dir: std::env::temp_dir().join("claudish-test-usage"),
            port: 0,
        };
        let resolution = crate::model::resolve(
            Some("oai@gpt-5.1-codex"),
            &crate::model::MapCredentials::new(&[("OPENAI_API_KEY", "k")]),
        );
        ResponsesHandler::new(&resolution, &ctx)
    }
}
