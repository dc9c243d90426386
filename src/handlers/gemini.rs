//! Gemini native handler.
//!
//! Speaks `models/{model}:streamGenerateContent?alt=sse` for Google AI
//! Studio, Vertex AI and Code Assist. Anthropic roles become `user`/`model`,
//! blocks become `parts` (`text`, `inlineData`, `functionCall`,
//! `functionResponse`), and tool schemas pass through the sanitizer.
//!
//! Thinking models attach a `thoughtSignature` to function-call parts and
//! reject a follow-up turn that does not echo it, so each emitted tool id is
//! remembered together with its signature and replayed when the client
//! re-asserts the call in a later message. A session recovered from history
//! has no recorded signature; the sentinel value below is accepted by the
//! upstream in that case.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::response::Response;
use eventsource_stream::Eventsource;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Map, Value};

use crate::anthropic::{
    ContentBlock, MessagesRequest, Role, SseEmitter, StopReason, ToolChoice,
};
use crate::error::{ProxyError, Result};
use crate::model::resolver::Resolution;
use crate::queue::GeminiQueue;
use crate::usage::SessionUsage;

use super::schema::sanitize_schema;
use super::translate::{gemini_thinking, neutralize_identity, GeminiThinking};
use super::{new_tool_id, send_upstream, sse_channel, HandlerContext, UpstreamHandler};

/// Echoed in place of a thought signature that was never observed.
const SIGNATURE_FALLBACK: &str = "skip_thought_signature_validator";

/// Gemini models narrate their own plans unless told not to.
const SELF_NARRATION_NOTE: &str = "\n\nAnswer the user directly. Do not describe what you are \
about to do, do not narrate tool usage, and do not restate these instructions.";

/// What we remember about a tool call across turns.
#[derive(Debug, Clone)]
pub(crate) struct ToolCallRecord {
    pub name: String,
    pub thought_signature: Option<String>,
}

type ToolCallMap = Arc<Mutex<HashMap<String, ToolCallRecord>>>;

/// Handler for the Gemini streaming API.
pub struct GeminiHandler {
    client: reqwest::Client,
    usage: Arc<SessionUsage>,
    queue: Arc<GeminiQueue<reqwest::Response>>,
    base_url: String,
    api_key: Option<String>,
    provider: String,
    model: String,
    tool_calls: ToolCallMap,
}

impl GeminiHandler {
    pub fn new(resolution: &Resolution, ctx: &HandlerContext) -> Self {
        let base_url = match resolution.provider.as_str() {
            "vertex" => vertex_base_url(ctx),
            _ => ctx
                .config
                .base_urls
                .gemini
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".into()),
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
            queue: ctx.gemini_queue.clone(),
            base_url,
            api_key: ctx.credential_value(&resolution.provider),
            provider: resolution.provider.clone(),
            model: resolution.model_name.clone(),
            tool_calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the `streamGenerateContent` request body.
    pub(crate) fn build_body(&self, request: &MessagesRequest) -> Value {
        let records = self.tool_calls.clone();
        let mut contents = Vec::new();

        for message in &request.messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            let parts = message_parts(message, &records);
            if !parts.is_empty() {
                contents.push(json!({"role": role, "parts": parts}));
            }
        }

        let mut body = json!({"contents": contents});

        if let Some(system) = request.system_text() {
            let system = neutralize_identity(&system, &self.model);
            body["systemInstruction"] = json!({
                "parts": [{"text": format!("{system}{SELF_NARRATION_NOTE}")}]
            });
        }

        let mut generation = Map::new();
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".into(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if let Some(budget) = request.thinking_budget() {
            let mut thinking = Map::new();
            thinking.insert("includeThoughts".into(), json!(true));
            match gemini_thinking(&self.model, budget) {
                GeminiThinking::Level(level) => {
                    thinking.insert("thinkingLevel".into(), json!(level));
                }
                GeminiThinking::Budget(tokens) => {
                    thinking.insert("thinkingBudget".into(), json!(tokens));
                }
            }
            generation.insert("thinkingConfig".into(), Value::Object(thinking));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                let declarations: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description.clone().unwrap_or_default(),
                            "parameters": sanitize_schema(&tool.input_schema),
                        })
                    })
                    .collect();
                body["tools"] = json!([{"functionDeclarations": declarations}]);
                if let Some(choice) = &request.tool_choice {
                    body["toolConfig"] = tool_config(choice);
                }
            }
        }

        body
    }

    fn request_url(&self) -> String {
        let mut url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        if self.provider == "google" {
            if let Some(key) = &self.api_key {
                url.push_str(&format!("&key={key}"));
            }
        }
        url
    }
}

/// Vertex publishes the same API under a project/location path.
fn vertex_base_url(ctx: &HandlerContext) -> String {
    let project = ctx
        .credentials
        .get("VERTEX_PROJECT")
        .unwrap_or_else(|| "-".into());
    let location = ctx
        .credentials
        .get("VERTEX_LOCATION")
        .unwrap_or_else(|| "us-central1".into());
    format!(
        "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google"
    )
}

fn tool_config(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"functionCallingConfig": {"mode": "AUTO"}}),
        ToolChoice::Any => json!({"functionCallingConfig": {"mode": "ANY"}}),
        ToolChoice::None => json!({"functionCallingConfig": {"mode": "NONE"}}),
        ToolChoice::Tool { name } => json!({
            "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
        }),
    }
}

/// Convert one Anthropic message into Gemini parts, resolving tool names and
/// signatures through the per-session record map.
fn message_parts(message: &crate::anthropic::Message, records: &ToolCallMap) -> Vec<Value> {
    let mut parts = Vec::new();
    for block in message.content.blocks() {
        match block {
            ContentBlock::Text { text } => {
                if !text.trim().is_empty() {
                    parts.push(json!({"text": text}));
                }
            }
            ContentBlock::Thinking { .. } => {
                // Raw thinking is never replayed; signatures ride functionCall parts.
            }
            ContentBlock::Image { source } => {
                if let (Some(media), Some(data)) = (&source.media_type, &source.data) {
                    parts.push(json!({
                        "inlineData": {"mimeType": media, "data": data}
                    }));
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                let signature = records
                    .lock()
                    .ok()
                    .and_then(|map| map.get(&id).and_then(|r| r.thought_signature.clone()))
                    .unwrap_or_else(|| SIGNATURE_FALLBACK.to_string());
                parts.push(json!({
                    "functionCall": {"name": name, "args": input},
                    "thoughtSignature": signature,
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let name = records
                    .lock()
                    .ok()
                    .and_then(|map| map.get(&tool_use_id).map(|r| r.name.clone()))
                    .unwrap_or_else(|| "tool".to_string());
                let text = content.map(|c| c.text()).unwrap_or_default();
                let response = serde_json::from_str::<Value>(&text)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| json!({"result": text}));
                parts.push(json!({
                    "functionResponse": {"name": name, "response": response}
                }));
            }
        }
    }
    parts
}

#[async_trait]
impl UpstreamHandler for GeminiHandler {
    async fn handle(&self, request: MessagesRequest) -> Result<Response> {
        let body = self.build_body(&request);
        let url = self.request_url();
        log::debug!(
            "[Gemini] {} ({} messages, queue delay adaptive)",
            self.model,
            request.messages.len()
        );

        let client = self.client.clone();
        let bearer = match self.provider.as_str() {
            "vertex" => self.api_key.clone(),
            "gemini-codeassist" => self.api_key.clone(),
            _ => None,
        };
        let thunk = Box::new(move || {
            let mut builder = client
                .post(&url)
                .header("Content-Type", "application/json");
            if let Some(token) = &bearer {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
            send_upstream(builder.json(&body)).boxed()
        });
        let upstream = self.queue.enqueue(thunk).await?;

        let (tx, response) = sse_channel();
        let mut emitter = SseEmitter::new(tx);
        let model = self.model.clone();
        let usage = Arc::clone(&self.usage);
        let records = self.tool_calls.clone();

        tokio::spawn(async move {
            let _keepalive = emitter.spawn_keepalive();
            if emitter.message_start(&model).await.is_err() {
                return;
            }

            let mut state = GeminiStreamState::default();
            let mut events = upstream.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => match serde_json::from_str::<Value>(&event.data) {
                        Ok(chunk) => {
                            if apply_chunk(&mut emitter, &mut state, &records, &chunk)
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(err) => log::debug!("[Gemini] unparseable chunk: {err}"),
                    },
                    Err(err) => {
                        if state.saw_usage {
                            usage.record_absolute(state.prompt_tokens, state.output_tokens);
                        } else {
                            usage.flush();
                        }
                        let err = ProxyError::Network(format!("upstream stream failed: {err}"));
                        let _ = emitter.fail(&err).await;
                        return;
                    }
                }
            }

            if state.saw_usage {
                usage.record_absolute(state.prompt_tokens, state.output_tokens);
            } else {
                usage.flush();
            }
            let _ = emitter
                .finish(state.stop_reason(), state.output_tokens)
                .await;
        });

        Ok(response)
    }

    async fn shutdown(&self) {
        self.usage.flush();
        if let Ok(mut map) = self.tool_calls.lock() {
            map.clear();
        }
    }
}

// ─── Stream state ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct GeminiStreamState {
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub saw_usage: bool,
    pub finish_reason: Option<String>,
    pub emitted_tool: bool,
}

impl GeminiStreamState {
    pub fn stop_reason(&self) -> StopReason {
        if self.emitted_tool {
            StopReason::ToolUse
        } else if self.finish_reason.as_deref() == Some("MAX_TOKENS") {
            StopReason::MaxTokens
        } else {
            StopReason::EndTurn
        }
    }
}

/// Fold one streamed Gemini chunk into the emitter, recording tool calls and
/// their signatures as they appear.
pub(crate) async fn apply_chunk(
    emitter: &mut SseEmitter,
    state: &mut GeminiStreamState,
    records: &ToolCallMap,
    chunk: &Value,
) -> Result<()> {
    if let Some(metadata) = chunk.get("usageMetadata") {
        if let Some(prompt) = metadata["promptTokenCount"].as_u64() {
            state.prompt_tokens = prompt;
            state.saw_usage = true;
        }
        if let Some(output) = metadata["candidatesTokenCount"].as_u64() {
            state.output_tokens = output;
        }
    }

    let Some(candidates) = chunk["candidates"].as_array() else {
        return Ok(());
    };
    for candidate in candidates {
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                apply_part(emitter, state, records, part).await?;
            }
        }
        if let Some(reason) = candidate["finishReason"].as_str() {
            state.finish_reason = Some(reason.to_string());
        }
    }
    Ok(())
}

async fn apply_part(
    emitter: &mut SseEmitter,
    state: &mut GeminiStreamState,
    records: &ToolCallMap,
    part: &Value,
) -> Result<()> {
    if let Some(call) = part.get("functionCall") {
        let name = call["name"].as_str().unwrap_or_default().to_string();
        let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
        let id = new_tool_id();

        let signature = part["thoughtSignature"].as_str().map(str::to_string);
        if let Ok(mut map) = records.lock() {
            map.insert(
                id.clone(),
                ToolCallRecord {
                    name: name.clone(),
                    thought_signature: signature,
                },
            );
        }

        state.emitted_tool = true;
        emitter.tool_use_start(&id, &name).await?;
        emitter.tool_args_delta(&args.to_string()).await?;
        emitter.close_block().await?;
        return Ok(());
    }

    // Thought text comes either flagged on a text part or as `thoughtText`.
    if part["thought"].as_bool() == Some(true) {
        if let Some(text) = part["text"].as_str() {
            emitter.thinking_delta(text).await?;
        }
        return Ok(());
    }
    if let Some(text) = part["thoughtText"].as_str() {
        emitter.thinking_delta(text).await?;
        return Ok(());
    }
    if let Some(text) = part["text"].as_str() {
        emitter.text_delta(text).await?;
    }
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
