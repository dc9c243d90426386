//! Shared request translation.
//!
//! Conversions every handler needs: flattening the system prompt, rewriting
//! the assistant's identity, mapping thinking budgets onto each upstream's
//! reasoning control, splitting the max-token parameter by model family, and
//! the full Anthropic→Chat-Completions message/tool rewrite used by the
//! OpenAI-shaped handlers.

use serde_json::{json, Value};

use crate::anthropic::{
    ContentBlock, MessageContent, MessagesRequest, Role, ToolChoice, ToolDefinition,
};

// ─── Identity ─────────────────────────────────────────────────────────────────

/// Rewrite the embedding assistant's proper name in a system prompt so the
/// upstream model does not claim to be someone it is not.
pub fn neutralize_identity(system: &str, model_display: &str) -> String {
    system
        .replace("Claude Code", "Claudish")
        .replace("Claude", model_display)
}

// ─── Thinking budget mapping ──────────────────────────────────────────────────

/// OpenAI o-series reasoning effort from an Anthropic thinking budget.
pub fn openai_reasoning_effort(budget_tokens: u32) -> &'static str {
    match budget_tokens {
        0..=3_999 => "minimal",
        4_000..=15_999 => "low",
        16_000..=31_999 => "medium",
        _ => "high",
    }
}

/// Gemini reasoning control: level for Gemini 3, token budget for 2.5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeminiThinking {
    Level(&'static str),
    Budget(u32),
}

/// Gemini 2.5 caps the thinking budget here.
const GEMINI_25_THINKING_CAP: u32 = 24_576;

pub fn gemini_thinking(model: &str, budget_tokens: u32) -> GeminiThinking {
    if model.starts_with("gemini-3") {
        if budget_tokens < 16_000 {
            GeminiThinking::Level("low")
        } else {
            GeminiThinking::Level("high")
        }
    } else {
        GeminiThinking::Budget(budget_tokens.min(GEMINI_25_THINKING_CAP))
    }
}

// ─── Max-token parameter split ────────────────────────────────────────────────

/// Newer OpenAI families reject `max_tokens` in favour of
/// `max_completion_tokens`.
pub fn uses_max_completion_tokens(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.starts_with("gpt-5")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("o4")
}

// ─── Chat Completions rewrite ─────────────────────────────────────────────────

/// Convert Anthropic messages into the Chat Completions `messages` array.
///
/// Tool-use blocks on assistant turns become `tool_calls`; tool-result blocks
/// become separate `role:"tool"` messages referencing the call id; images on
/// user turns become `image_url` content parts.
pub fn chat_messages(
    request: &MessagesRequest,
    system: Option<&str>,
) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(system) = system {
        out.push(json!({"role": "system", "content": system}));
    }

    for message in &request.messages {
        match message.role {
            Role::Assistant => push_assistant_message(&mut out, &message.content),
            Role::User => push_user_message(&mut out, &message.content),
        }
    }
    out
}

fn push_assistant_message(out: &mut Vec<Value>, content: &MessageContent) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content.blocks() {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": input.to_string(),
                    }
                }));
            }
            // Thinking is not replayed to Chat Completions upstreams.
            ContentBlock::Thinking { .. } => {}
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
        }
    }

    let mut message = json!({"role": "assistant"});
    message["content"] = if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }
    out.push(message);
}

fn push_user_message(out: &mut Vec<Value>, content: &MessageContent) {
    let mut parts: Vec<Value> = Vec::new();
    let mut has_image = false;

    for block in content.blocks() {
        match block {
            ContentBlock::Text { text } => {
                parts.push(json!({"type": "text", "text": text}));
            }
            ContentBlock::Image { source } => {
                if let Some(url) = source.as_url() {
                    has_image = true;
                    parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Tool results are standalone messages; flush any pending
                // user content first to preserve ordering.
                flush_user_parts(out, &mut parts, &mut has_image);
                let mut text = content.map(|c| c.text()).unwrap_or_default();
                if is_error == Some(true) && !text.starts_with("Error") {
                    text = format!("Error: {text}");
                }
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": text,
                }));
            }
            ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } => {}
        }
    }
    flush_user_parts(out, &mut parts, &mut has_image);
}

fn flush_user_parts(out: &mut Vec<Value>, parts: &mut Vec<Value>, has_image: &mut bool) {
    if parts.is_empty() {
        return;
    }
    let content = if *has_image {
        Value::Array(std::mem::take(parts))
    } else {
        // Text-only content collapses to a plain string.
        let text = std::mem::take(parts)
            .into_iter()
            .filter_map(|p| p["text"].as_str().map(str::to_string))
            .collect::<Vec<_>>()
            .join("\n");
        Value::String(text)
    };
    *has_image = false;
    out.push(json!({"role": "user", "content": content}));
}

/// Convert Anthropic tool definitions to Chat Completions functions.
pub fn chat_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

/// Convert the Anthropic tool choice to the Chat Completions form.
pub fn chat_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Value) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": messages,
        }))
        .unwrap()
    }

    // ── Identity ──────────────────────────────────────────────────────────

    #[test]
    fn identity_rewrite_covers_both_spellings() {
        let system = "You are Claude Code, based on Claude.";
        let rewritten = neutralize_identity(system, "GPT-4o");
        assert!(!rewritten.contains("Claude"));
        assert!(rewritten.contains("Claudish"));
        assert!(rewritten.contains("GPT-4o"));
    }

    // ── Thinking mapping ──────────────────────────────────────────────────

    #[test]
    fn reasoning_effort_buckets() {
        assert_eq!(openai_reasoning_effort(0), "minimal");
        assert_eq!(openai_reasoning_effort(3_999), "minimal");
        assert_eq!(openai_reasoning_effort(4_000), "low");
        assert_eq!(openai_reasoning_effort(16_000), "medium");
        assert_eq!(openai_reasoning_effort(32_000), "high");
    }

    #[test]
    fn gemini_thinking_split() {
        assert_eq!(
            gemini_thinking("gemini-3-pro-preview", 8_000),
            GeminiThinking::Level("low")
        );
        assert_eq!(
            gemini_thinking("gemini-3-pro-preview", 20_000),
            GeminiThinking::Level("high")
        );
        assert_eq!(
            gemini_thinking("gemini-2.5-pro", 8_000),
            GeminiThinking::Budget(8_000)
        );
        assert_eq!(
            gemini_thinking("gemini-2.5-pro", 64_000),
            GeminiThinking::Budget(24_576)
        );
    }

    #[test]
    fn max_completion_tokens_families() {
        assert!(uses_max_completion_tokens("gpt-5"));
        assert!(uses_max_completion_tokens("o1-preview"));
        assert!(uses_max_completion_tokens("o3-mini"));
        assert!(uses_max_completion_tokens("o4-mini"));
        assert!(!uses_max_completion_tokens("gpt-4o"));
        assert!(!uses_max_completion_tokens("kimi-k2"));
    }

    // ── Message rewrite ───────────────────────────────────────────────────

    #[test]
    fn plain_conversation_round_trip() {
        let req = request(json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
            {"role": "user", "content": "bye"}
        ]));
        let messages = chat_messages(&req, Some("be brief"));
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "hi");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "bye");
    }

    #[test]
    fn tool_cycle_becomes_tool_calls_and_tool_message() {
        let req = request(json!([
            {"role": "user", "content": "search x"},
            {"role": "assistant", "content": [
                {"type": "text", "text": "Searching."},
                {"type": "tool_use", "id": "toolu_01", "name": "search", "input": {"q": "x"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_01", "content": "42 results"}
            ]}
        ]));
        let messages = chat_messages(&req, None);
        assert_eq!(messages.len(), 3);

        let assistant = &messages[1];
        assert_eq!(assistant["tool_calls"][0]["id"], "toolu_01");
        assert_eq!(assistant["tool_calls"][0]["function"]["name"], "search");
        let args: Value =
            serde_json::from_str(assistant["tool_calls"][0]["function"]["arguments"].as_str().unwrap())
                .unwrap();
        assert_eq!(args, json!({"q": "x"}));

        let tool = &messages[2];
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "toolu_01");
        assert_eq!(tool["content"], "42 results");
    }

    #[test]
    fn error_tool_result_is_prefixed() {
        let req = request(json!([
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_01",
                 "content": "file not found", "is_error": true}
            ]}
        ]));
        let messages = chat_messages(&req, None);
        assert_eq!(messages[0]["content"], "Error: file not found");
    }

    #[test]
    fn image_turns_into_image_url_part() {
        let req = request(json!([
            {"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image", "source": {
                    "type": "base64", "media_type": "image/png", "data": "AAAA"}}
            ]}
        ]));
        let messages = chat_messages(&req, None);
        let content = messages[0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(
            content[1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    // ── Tools ─────────────────────────────────────────────────────────────

    #[test]
    fn tool_definitions_become_functions() {
        let tools: Vec<ToolDefinition> = serde_json::from_value(json!([
            {"name": "search", "description": "Find things",
             "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}}
        ]))
        .unwrap();
        let converted = chat_tools(&tools);
        assert_eq!(converted[0]["type"], "function");
        assert_eq!(converted[0]["function"]["name"], "search");
        assert_eq!(
            converted[0]["function"]["parameters"]["properties"]["q"]["type"],
            "string"
        );
    }

    #[test]
    fn tool_choice_mapping() {
        assert_eq!(chat_tool_choice(&ToolChoice::Auto), json!("auto"));
        assert_eq!(chat_tool_choice(&ToolChoice::Any), json!("required"));
        assert_eq!(chat_tool_choice(&ToolChoice::None), json!("none"));
        assert_eq!(
            chat_tool_choice(&ToolChoice::Tool { name: "search".into() }),
            json!({"type": "function", "function": {"name": "search"}})
        );
    }
}
