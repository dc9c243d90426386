//! Chat Completions handler.
//!
//! Serves every upstream that speaks the OpenAI `/v1/chat/completions`
//! protocol: OpenAI itself, OpenRouter, MiniMax, Kimi, GLM, Z.AI, OpenCode
//! Zen, Poe, and the local servers (Ollama, LM Studio, vLLM, MLX, custom
//! URLs). Local requests are admitted through the GPU queue; everything else
//! goes straight out.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;
use eventsource_stream::Eventsource;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};

use crate::anthropic::{MessagesRequest, SseEmitter, StopReason};
use crate::error::{ProxyError, Result};
use crate::model::resolver::Resolution;
use crate::model::ParsedModel;
use crate::queue::{JobThunk, LocalQueue};
use crate::usage::SessionUsage;

use super::translate::{
    chat_messages, chat_tool_choice, chat_tools, neutralize_identity, openai_reasoning_effort,
    uses_max_completion_tokens,
};
use super::{new_tool_id, send_upstream, sse_channel, HandlerContext, UpstreamHandler};

/// Referer/title advertised to OpenRouter for app attribution.
const OPENROUTER_REFERER: &str = "https://github.com/madappgang/claudish";
const OPENROUTER_TITLE: &str = "Claudish";

/// Appended for Poe's Grok family, which otherwise narrates tool calls as
/// XML markup instead of using the function-calling interface.
const GROK_TOOL_NOTE: &str = "\n\nNever write tool calls as XML or pseudo-markup in your reply; \
invoke tools only through the function-calling interface.";

struct LocalDispatch {
    queue: Arc<LocalQueue<reqwest::Response>>,
    concurrency: Option<usize>,
}

/// Handler for OpenAI-compatible Chat Completions upstreams.
pub struct ChatCompletionsHandler {
    client: reqwest::Client,
    usage: Arc<SessionUsage>,
    base_url: String,
    api_key: Option<String>,
    extra_headers: Vec<(&'static str, String)>,
    provider: String,
    model: String,
    display_model: String,
    local: Option<LocalDispatch>,
}

impl ChatCompletionsHandler {
    /// Remote constructor: cloud providers with fixed base URLs.
    pub fn remote(resolution: &Resolution, ctx: &HandlerContext) -> Self {
        let provider = resolution.provider.clone();
        let base_url = match provider.as_str() {
            "openai" => ctx
                .config
                .base_urls
                .openai
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            "openrouter" => "https://openrouter.ai/api/v1".into(),
            "minimax" => "https://api.minimax.io/v1".into(),
            "kimi" => "https://api.moonshot.ai/v1".into(),
            "kimi-coding" => "https://api.kimi.com/coding/v1".into(),
            "glm" => "https://open.bigmodel.cn/api/paas/v4".into(),
            "zai" => "https://api.z.ai/api/paas/v4".into(),
            "opencode-zen" => ctx
                .config
                .base_urls
                .opencode
                .clone()
                .unwrap_or_else(|| "https://opencode.ai/zen/v1".into()),
            "poe" => "https://api.poe.com/v1".into(),
            other => {
                log::warn!("[ChatCompletions] no base URL for {other}, using OpenRouter");
                "https://openrouter.ai/api/v1".into()
            }
        };

        let mut extra_headers = Vec::new();
        if provider == "openrouter" {
            extra_headers.push(("HTTP-Referer", OPENROUTER_REFERER.to_string()));
            extra_headers.push(("X-Title", OPENROUTER_TITLE.to_string()));
        }

        // Poe models arrive as `poe/<bot>`; the wire call wants the bare name.
        let model = match provider.as_str() {
            "poe" => resolution
                .model_name
                .strip_prefix("poe/")
                .unwrap_or(&resolution.model_name)
                .to_string(),
            _ => resolution.model_name.clone(),
        };

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
            base_url,
            api_key: ctx.credential_value(&provider),
            extra_headers,
            display_model: model.clone(),
            model,
            provider,
            local: None,
        }
    }

    /// Local constructor: OpenAI-compatible servers on this machine.
    pub fn local(resolution: &Resolution, parsed: &ParsedModel, ctx: &HandlerContext) -> Self {
        let urls = &ctx.config.base_urls;
        let (base_url, model) = match resolution.provider.as_str() {
            "ollama" => (
                urls.ollama
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434/v1".into()),
                resolution.model_name.clone(),
            ),
            "lmstudio" => (
                urls.lmstudio
                    .clone()
                    .unwrap_or_else(|| "http://localhost:1234/v1".into()),
                resolution.model_name.clone(),
            ),
            "vllm" => (
                urls.vllm
                    .clone()
                    .unwrap_or_else(|| "http://localhost:8000/v1".into()),
                resolution.model_name.clone(),
            ),
            "mlx" => (
                urls.mlx
                    .clone()
                    .unwrap_or_else(|| "http://localhost:8080/v1".into()),
                resolution.model_name.clone(),
            ),
            // Raw URL spec: the "model" field is the endpoint itself.
            _ => (
                resolution.model_name.trim_end_matches('/').to_string(),
                "default".to_string(),
            ),
        };

        Self {
            client: ctx.client.clone(),
            usage: Arc::new(SessionUsage::new(
                ctx.pricing.clone(),
                &resolution.provider,
                &resolution.provider_name,
                &model,
                ctx.port,
                ctx.usage_dir.clone(),
                ctx.config.billing.context_drop_threshold,
            )),
            base_url,
            api_key: None,
            extra_headers: Vec::new(),
            provider: resolution.provider.clone(),
            display_model: model.clone(),
            model,
            local: Some(LocalDispatch {
                queue: ctx.local_queue.clone(),
                concurrency: parsed.concurrency.or(resolution.concurrency),
            }),
        }
    }

    /// Build the Chat Completions request body.
    fn build_body(&self, request: &MessagesRequest) -> Value {
        let system = request
            .system_text()
            .map(|s| self.decorate_system(&neutralize_identity(&s, &self.display_model)));

        let mut body = json!({
            "model": self.model,
            "messages": chat_messages(request, system.as_deref()),
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if let Some(max_tokens) = request.max_tokens {
            if uses_max_completion_tokens(&self.model) {
                body["max_completion_tokens"] = json!(max_tokens);
            } else {
                body["max_tokens"] = json!(max_tokens);
            }
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop_sequences {
            if !stop.is_empty() {
                body["stop"] = json!(stop);
            }
        }
        if let Some(budget) = request.thinking_budget() {
            if self.provider == "openai" && uses_max_completion_tokens(&self.model) {
                body["reasoning_effort"] = json!(openai_reasoning_effort(budget));
            }
        }
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = json!(chat_tools(tools));
                body["tool_choice"] = request
                    .tool_choice
                    .as_ref()
                    .map(chat_tool_choice)
                    .unwrap_or_else(|| json!("auto"));
            }
        }

        body
    }

    /// Extra system text some upstreams need.
    fn decorate_system(&self, system: &str) -> String {
        if self.provider == "poe" && self.model.to_lowercase().contains("grok") {
            format!("{system}{GROK_TOOL_NOTE}")
        } else {
            system.to_string()
        }
    }

    fn request_thunk(&self, body: Value) -> JobThunk<reqwest::Response> {
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.base_url);
        let api_key = self.api_key.clone();
        let extra = self.extra_headers.clone();
        Box::new(move || {
            let mut builder = client.post(&url).header("Content-Type", "application/json");
            if let Some(key) = &api_key {
                builder = builder.header("Authorization", format!("Bearer {key}"));
            }
            for (name, value) in &extra {
                builder = builder.header(*name, value.clone());
            }
            send_upstream(builder.json(&body)).boxed()
        })
    }

    async fn dispatch(&self, body: Value) -> Result<reqwest::Response> {
        let thunk = self.request_thunk(body);
        match &self.local {
            Some(local) => {
                local
                    .queue
                    .enqueue(thunk, &self.provider, local.concurrency)
                    .await
            }
            None => thunk().await,
        }
    }
}

#[async_trait]
impl UpstreamHandler for ChatCompletionsHandler {
    async fn handle(&self, request: MessagesRequest) -> Result<Response> {
        let body = self.build_body(&request);
        log::debug!(
            "[ChatCompletions] {} -> {} ({} messages)",
            self.model,
            self.base_url,
            request.messages.len()
        );
        let upstream = self.dispatch(body).await?;

        let (tx, response) = sse_channel();
        let mut emitter = SseEmitter::new(tx);
        let model = self.display_model.clone();
        let usage = Arc::clone(&self.usage);

        tokio::spawn(async move {
            let _keepalive = emitter.spawn_keepalive();
            if emitter.message_start(&model).await.is_err() {
                return;
            }

            let mut state = ChatStreamState::default();
            let mut events = upstream.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data.trim() == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<Value>(&event.data) {
                            Ok(chunk) => {
                                if apply_chunk(&mut emitter, &mut state, &chunk).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                log::debug!("[ChatCompletions] unparseable chunk: {err}");
                            }
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
                .finish(state.stop_reason(), state.completion_tokens)
                .await;
        });

        Ok(response)
    }

    async fn shutdown(&self) {
        self.usage.flush();
    }
}

fn record_usage(usage: &SessionUsage, state: &ChatStreamState) {
    if state.saw_usage {
        usage.record_incremental(state.prompt_tokens, state.completion_tokens);
    } else {
        usage.flush();
    }
}

// ─── Stream state ─────────────────────────────────────────────────────────────

/// Accumulated view of one Chat Completions stream.
#[derive(Debug, Default)]
pub(crate) struct ChatStreamState {
    pub finish_reason: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub saw_usage: bool,
    /// Upstream index of the tool call currently streaming arguments.
    current_tool: Option<i64>,
}

impl ChatStreamState {
    pub fn stop_reason(&self) -> StopReason {
        match self.finish_reason.as_deref() {
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        }
    }
}

/// Fold one streamed chunk into the emitter.
pub(crate) async fn apply_chunk(
    emitter: &mut SseEmitter,
    state: &mut ChatStreamState,
    chunk: &Value,
) -> Result<()> {
    if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
        if let Some(prompt) = usage["prompt_tokens"].as_u64() {
            state.prompt_tokens = prompt;
            state.saw_usage = true;
        }
        if let Some(completion) = usage["completion_tokens"].as_u64() {
            state.completion_tokens = completion;
        }
    }

    let Some(choices) = chunk["choices"].as_array() else {
        return Ok(());
    };
    for choice in choices {
        let delta = &choice["delta"];

        // Reasoning arrives under different keys across vendors.
        let reasoning = delta["reasoning_content"]
            .as_str()
            .or_else(|| delta["reasoning"].as_str());
        if let Some(text) = reasoning {
            emitter.thinking_delta(text).await?;
        }

        if let Some(text) = delta["content"].as_str() {
            emitter.text_delta(text).await?;
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for call in tool_calls {
                let index = call["index"].as_i64().unwrap_or(0);
                if state.current_tool != Some(index) {
                    let id = call["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(new_tool_id);
                    let name = call["function"]["name"].as_str().unwrap_or_default();
                    emitter.tool_use_start(&id, name).await?;
                    state.current_tool = Some(index);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        emitter.tool_args_delta(args).await?;
                    }
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            state.finish_reason = Some(reason.to_string());
        }
    }
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn parse_frames(frames: &[Bytes]) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        for frame in frames {
            let text = std::str::from_utf8(frame).unwrap();
            if text.starts_with("data: [DONE]") {
                out.push(("done".to_string(), Value::Null));
                continue;
            }
            let mut lines = text.lines();
            let event = lines
                .next()
                .and_then(|l| l.strip_prefix("event: "))
                .unwrap()
                .to_string();
            let data: Value =
                serde_json::from_str(lines.next().and_then(|l| l.strip_prefix("data: ")).unwrap())
                    .unwrap();
            out.push((event, data));
        }
        out
    }

    async fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<(String, Value)> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        parse_frames(&frames)
    }

    /// Scenario: one text chunk, trailing usage, clean finish.
    #[tokio::test]
    async fn text_stream_with_trailing_usage() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut emitter = SseEmitter::new(tx);
        let mut state = ChatStreamState::default();

        emitter.message_start("gpt-4o").await.unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [{"delta": {"content": "Hello"}}]}),
        )
        .await
        .unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
        )
        .await
        .unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 1}}),
        )
        .await
        .unwrap();
        emitter
            .finish(state.stop_reason(), state.completion_tokens)
            .await
            .unwrap();

        assert!(state.saw_usage);
        assert_eq!(state.prompt_tokens, 5);
        assert_eq!(state.completion_tokens, 1);

        let events = drain(&mut rx).await;
        let names: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
                "done"
            ]
        );
        let (_, delta) = &events[3];
        assert_eq!(delta["delta"]["text"], "Hello");
        let (_, message_delta) = &events[5];
        assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(message_delta["usage"]["output_tokens"], 1);
    }

    /// Tool-call argument fragments bind to one tool_use block per index.
    #[tokio::test]
    async fn streamed_tool_call_arguments() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut emitter = SseEmitter::new(tx);
        let mut state = ChatStreamState::default();

        emitter.message_start("gpt-4o").await.unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_abc", "function": {"name": "search", "arguments": ""}}
            ]}}]}),
        )
        .await
        .unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"q\":"}}
            ]}}]}),
        )
        .await
        .unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"x\"}"}}
            ]}, "finish_reason": "tool_calls"}]}),
        )
        .await
        .unwrap();
        emitter
            .finish(state.stop_reason(), state.completion_tokens)
            .await
            .unwrap();

        let events = drain(&mut rx).await;
        let start = events
            .iter()
            .find(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d)
            .unwrap();
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["content_block"]["id"], "call_abc");
        assert_eq!(start["content_block"]["name"], "search");

        let args: String = events
            .iter()
            .filter(|(e, _)| e == "content_block_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(args, "{\"q\":\"x\"}");
        assert_eq!(state.stop_reason(), StopReason::ToolUse);
    }

    /// Text closes before the tool block opens; two tools never interleave.
    #[tokio::test]
    async fn text_then_two_tools_stay_well_nested() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut emitter = SseEmitter::new(tx);
        let mut state = ChatStreamState::default();

        emitter.message_start("m").await.unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [{"delta": {"content": "Using tools."}}]}),
        )
        .await
        .unwrap();
        for (index, id) in [(0, "call_a"), (1, "call_b")] {
            apply_chunk(
                &mut emitter,
                &mut state,
                &serde_json::json!({"choices": [{"delta": {"tool_calls": [
                    {"index": index, "id": id, "function": {"name": "t", "arguments": "{}"}}
                ]}}]}),
            )
            .await
            .unwrap();
        }
        emitter.finish(StopReason::ToolUse, 0).await.unwrap();

        let events = drain(&mut rx).await;
        let mut open: Option<i64> = None;
        for (event, data) in &events {
            match event.as_str() {
                "content_block_start" => {
                    assert!(open.is_none());
                    open = data["index"].as_i64();
                }
                "content_block_stop" => {
                    assert_eq!(data["index"].as_i64(), open);
                    open = None;
                }
                _ => {}
            }
        }
        let starts = events
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .count();
        assert_eq!(starts, 3);
    }

    /// Reasoning deltas open a thinking block ahead of the text block.
    #[tokio::test]
    async fn reasoning_content_maps_to_thinking() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut emitter = SseEmitter::new(tx);
        let mut state = ChatStreamState::default();

        emitter.message_start("kimi-k2-thinking").await.unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [{"delta": {"reasoning_content": "thinking..."}}]}),
        )
        .await
        .unwrap();
        apply_chunk(
            &mut emitter,
            &mut state,
            &serde_json::json!({"choices": [{"delta": {"content": "Answer"}}]}),
        )
        .await
        .unwrap();
        emitter.finish(StopReason::EndTurn, 2).await.unwrap();

        let events = drain(&mut rx).await;
        let kinds: Vec<&str> = events
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d["content_block"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["thinking", "text"]);
    }
}
