//! Model spec parsing.
//!
//! Turns a user-supplied model string (`g@gemini-2.5-pro`, `ollama@qwen3:2`,
//! `gemini/gemini-2.5-flash`, `gpt-4o`, a bare URL, ...) into a
//! [`ParsedModel`] record. Pure string work, no I/O; resolution against the
//! environment happens in `resolver.rs`.
//!
//! Three syntaxes are accepted, tried in order:
//! 1. `provider@model[:concurrency]` — explicit, preferred.
//! 2. `prefix/model` or `prefix:model` — legacy, kept for compatibility.
//! 3. Bare model ids matched against per-vendor naming patterns.

/// Sentinel provider for specs that look like nothing we know.
pub const PROVIDER_UNKNOWN: &str = "unknown";
/// Sentinel provider for Anthropic models handled by the embedding runtime.
pub const PROVIDER_NATIVE_ANTHROPIC: &str = "native-anthropic";
/// Sentinel provider for raw `http(s)://` specs.
pub const PROVIDER_CUSTOM_URL: &str = "custom-url";

/// Providers served by a local OpenAI-compatible server.
pub const LOCAL_PROVIDERS: &[&str] = &["ollama", "lmstudio", "vllm", "mlx"];

/// Parsed form of a model spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModel {
    /// Normalized lowercase provider, or one of the sentinels.
    pub provider: String,
    /// Upstream-facing model id, stripped of any routing prefix.
    pub model: String,
    /// The spec exactly as supplied.
    pub original: String,
    /// Parallelism override for local providers; `Some(0)` bypasses the queue.
    pub concurrency: Option<usize>,
    /// Whether the legacy `prefix/` or `prefix:` syntax was used.
    pub is_legacy_syntax: bool,
    /// Whether the provider was named explicitly (`provider@model`).
    pub is_explicit_provider: bool,
}

impl ParsedModel {
    /// Canonical `provider@model[:concurrency]` spelling of this record.
    pub fn canonical_spec(&self) -> String {
        match self.concurrency {
            Some(n) => format!("{}@{}:{}", self.provider, self.model, n),
            None => format!("{}@{}", self.provider, self.model),
        }
    }

    /// Whether this spec targets a local OpenAI-compatible server.
    pub fn is_local(&self) -> bool {
        LOCAL_PROVIDERS.contains(&self.provider.as_str())
    }
}

// ─── Shortcut table ───────────────────────────────────────────────────────────

/// Resolve a `name@` shortcut to its canonical provider.
///
/// Unknown names pass through unchanged; the resolver reports them as
/// unknown providers with an actionable message.
fn resolve_shortcut(name: &str) -> &str {
    match name {
        "g" | "gemini" | "google" => "google",
        "oai" | "openai" => "openai",
        "or" | "openrouter" => "openrouter",
        "mm" | "mmax" | "minimax" => "minimax",
        "kimi" | "moon" | "moonshot" => "kimi",
        "kc" | "kimi-coding" => "kimi-coding",
        "glm" | "zhipu" => "glm",
        "zai" => "zai",
        "oc" | "llama" | "lc" | "meta" | "ollamacloud" => "ollamacloud",
        "zen" | "opencode-zen" => "opencode-zen",
        "v" | "vertex" => "vertex",
        "go" | "gemini-codeassist" => "gemini-codeassist",
        "poe" => "poe",
        "ollama" => "ollama",
        "lms" | "lmstudio" | "mlstudio" => "lmstudio",
        "vllm" => "vllm",
        "mlx" => "mlx",
        other => other,
    }
}

// ─── Legacy prefixes ──────────────────────────────────────────────────────────

/// Legacy prefix table, first match wins. Longer spellings come before the
/// shorter ones they contain.
const LEGACY_PREFIXES: &[(&str, &str)] = &[
    ("gemini/", "google"),
    ("g/", "google"),
    ("oai/", "openai"),
    ("or/", "openrouter"),
    ("mmax/", "minimax"),
    ("kc/", "kimi-coding"),
    ("kimi/", "kimi"),
    ("glm/", "glm"),
    ("zhipu/", "glm"),
    ("zai/", "zai"),
    ("oc/", "ollamacloud"),
    ("zen/", "opencode-zen"),
    ("v/", "vertex"),
    ("go/", "gemini-codeassist"),
    ("ollama/", "ollama"),
    ("ollama:", "ollama"),
    ("lmstudio/", "lmstudio"),
    ("lmstudio:", "lmstudio"),
    ("mlstudio/", "lmstudio"),
    ("mlstudio:", "lmstudio"),
    ("vllm/", "vllm"),
    ("vllm:", "vllm"),
    ("mlx/", "mlx"),
    ("mlx:", "mlx"),
];

// ─── Concurrency split ────────────────────────────────────────────────────────

/// Split `model[:n]` on the last colon when the suffix is a non-negative
/// integer. Model names containing colons (`qwen3:32b`) are left intact.
fn split_concurrency(model: &str) -> (String, Option<usize>) {
    if let Some(idx) = model.rfind(':') {
        let suffix = &model[idx + 1..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = suffix.parse::<usize>() {
                return (model[..idx].to_string(), Some(n));
            }
        }
    }
    (model.to_string(), None)
}

// ─── parse ────────────────────────────────────────────────────────────────────

/// Parse a model spec string. Total: every input yields a record.
pub fn parse(spec: &str) -> ParsedModel {
    let original = spec.to_string();
    let spec = spec.trim();

    // 1. Raw URL → custom local endpoint.
    if spec.starts_with("http://") || spec.starts_with("https://") {
        return ParsedModel {
            provider: PROVIDER_CUSTOM_URL.to_string(),
            model: spec.to_string(),
            original,
            concurrency: None,
            is_legacy_syntax: false,
            is_explicit_provider: false,
        };
    }

    // 2. Explicit `provider@model` syntax.
    if let Some(at) = spec.find('@') {
        let (name, rest) = (&spec[..at], &spec[at + 1..]);
        if !name.is_empty() && !rest.is_empty() {
            let provider = resolve_shortcut(&name.to_lowercase()).to_string();
            let (model, concurrency) = split_concurrency(rest);
            return ParsedModel {
                provider,
                model,
                original,
                concurrency,
                is_legacy_syntax: false,
                is_explicit_provider: true,
            };
        }
    }

    // 3. Legacy prefixes.
    for (prefix, provider) in LEGACY_PREFIXES {
        if let Some(rest) = strip_prefix_ci(spec, prefix) {
            let (model, concurrency) = if LOCAL_PROVIDERS.contains(provider) {
                split_concurrency(rest)
            } else {
                (rest.to_string(), None)
            };
            return ParsedModel {
                provider: (*provider).to_string(),
                model,
                original,
                concurrency,
                is_legacy_syntax: true,
                is_explicit_provider: false,
            };
        }
    }

    // 4. Native model-name detection.
    if let Some(parsed) = detect_native(spec, &original) {
        return parsed;
    }

    // 5. A slash we could not place → unknown vendor.
    if spec.contains('/') {
        return ParsedModel {
            provider: PROVIDER_UNKNOWN.to_string(),
            model: spec.to_string(),
            original,
            concurrency: None,
            is_legacy_syntax: false,
            is_explicit_provider: false,
        };
    }

    // 6. Anything else is assumed to be an Anthropic model for the runtime.
    ParsedModel {
        provider: PROVIDER_NATIVE_ANTHROPIC.to_string(),
        model: spec.to_string(),
        original,
        concurrency: None,
        is_legacy_syntax: false,
        is_explicit_provider: false,
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

/// Match bare model ids against per-vendor naming patterns, in order.
/// Ordering matters: `kimi-for-coding` must win over the general `kimi-`.
/// Prefix checks are case-insensitive but the stripped model keeps its
/// original casing (Poe bot names are case-sensitive).
fn detect_native(spec: &str, original: &str) -> Option<ParsedModel> {
    let lower = spec.to_lowercase();

    let hit = |provider: &str, model: &str| {
        Some(ParsedModel {
            provider: provider.to_string(),
            model: model.to_string(),
            original: original.to_string(),
            concurrency: None,
            is_legacy_syntax: false,
            is_explicit_provider: false,
        })
    };
    // `get` instead of slicing: a lowercased non-ASCII char can match an
    // ASCII prefix without sharing its byte length.
    let strip = |prefix: &str| {
        if lower.starts_with(prefix) {
            spec.get(prefix.len()..)
        } else {
            None
        }
    };

    if let Some(rest) = strip("google/") {
        return hit("google", rest);
    }
    if lower.starts_with("gemini-") {
        return hit("google", spec);
    }
    if let Some(rest) = strip("openai/") {
        return hit("openai", rest);
    }
    if lower.starts_with("gpt-")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("chatgpt-")
    {
        return hit("openai", spec);
    }
    if let Some(rest) = strip("minimax/") {
        return hit("minimax", rest);
    }
    if lower.starts_with("minimax-") || lower.starts_with("abab-") {
        return hit("minimax", spec);
    }
    if lower == "kimi-for-coding" {
        return hit("kimi-coding", spec);
    }
    if let Some(rest) = strip("moonshot/") {
        return hit("kimi", rest);
    }
    if lower.starts_with("moonshot-") || lower.starts_with("kimi-") {
        return hit("kimi", spec);
    }
    if let Some(rest) = strip("zhipu/") {
        return hit("glm", rest);
    }
    if lower.starts_with("glm-") || lower.starts_with("chatglm-") {
        return hit("glm", spec);
    }
    if let Some(rest) = strip("z-ai/") {
        return hit("zai", rest);
    }
    if let Some(rest) = strip("zai/") {
        return hit("zai", rest);
    }
    if let Some(rest) = strip("ollamacloud/") {
        return hit("ollamacloud", rest);
    }
    if let Some(rest) = strip("meta-llama/") {
        return hit("ollamacloud", rest);
    }
    if lower.starts_with("llama-") || lower.starts_with("llama3") {
        return hit("ollamacloud", spec);
    }
    if let Some(rest) = strip("poe:") {
        return hit("poe", rest);
    }
    if let Some(rest) = strip("anthropic/") {
        return hit(PROVIDER_NATIVE_ANTHROPIC, rest);
    }
    if lower.starts_with("claude-") {
        return hit(PROVIDER_NATIVE_ANTHROPIC, spec);
    }

    None
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Explicit provider syntax ──────────────────────────────────────────

    #[test]
    fn explicit_shortcut_resolution() {
        for (shortcut, canonical) in [
            ("g", "google"),
            ("gemini", "google"),
            ("oai", "openai"),
            ("or", "openrouter"),
            ("mm", "minimax"),
            ("mmax", "minimax"),
            ("kimi", "kimi"),
            ("moon", "kimi"),
            ("moonshot", "kimi"),
            ("kc", "kimi-coding"),
            ("glm", "glm"),
            ("zhipu", "glm"),
            ("zai", "zai"),
            ("oc", "ollamacloud"),
            ("llama", "ollamacloud"),
            ("lc", "ollamacloud"),
            ("meta", "ollamacloud"),
            ("zen", "opencode-zen"),
            ("v", "vertex"),
            ("vertex", "vertex"),
            ("go", "gemini-codeassist"),
            ("poe", "poe"),
            ("ollama", "ollama"),
            ("lms", "lmstudio"),
            ("lmstudio", "lmstudio"),
            ("mlstudio", "lmstudio"),
            ("vllm", "vllm"),
            ("mlx", "mlx"),
        ] {
            let parsed = parse(&format!("{shortcut}@some-model"));
            assert_eq!(parsed.provider, canonical, "shortcut {shortcut}");
            assert!(parsed.is_explicit_provider);
            assert!(!parsed.is_legacy_syntax);
        }
    }

    #[test]
    fn explicit_syntax_is_case_insensitive_on_provider() {
        let parsed = parse("OAI@GPT-4o");
        assert_eq!(parsed.provider, "openai");
        assert_eq!(parsed.model, "GPT-4o");
    }

    #[test]
    fn concurrency_suffix_parses() {
        let parsed = parse("ollama@qwen3-coder:2");
        assert_eq!(parsed.provider, "ollama");
        assert_eq!(parsed.model, "qwen3-coder");
        assert_eq!(parsed.concurrency, Some(2));
    }

    #[test]
    fn concurrency_zero_means_bypass() {
        let parsed = parse("lmstudio@devstral:0");
        assert_eq!(parsed.concurrency, Some(0));
    }

    #[test]
    fn model_tag_with_nonnumeric_suffix_keeps_colon() {
        let parsed = parse("ollama@qwen3:32b");
        assert_eq!(parsed.model, "qwen3:32b");
        assert_eq!(parsed.concurrency, None);
    }

    #[test]
    fn model_tag_and_concurrency_both_present() {
        let parsed = parse("ollama@qwen3:32b:4");
        assert_eq!(parsed.model, "qwen3:32b");
        assert_eq!(parsed.concurrency, Some(4));
    }

    // ── Legacy prefixes ───────────────────────────────────────────────────

    #[test]
    fn legacy_prefix_sets_flag() {
        let parsed = parse("gemini/gemini-2.5-pro");
        assert_eq!(parsed.provider, "google");
        assert_eq!(parsed.model, "gemini-2.5-pro");
        assert!(parsed.is_legacy_syntax);
        assert!(!parsed.is_explicit_provider);
    }

    #[test]
    fn legacy_local_prefix_concurrency() {
        let parsed = parse("ollama:llama3.2:3");
        assert_eq!(parsed.provider, "ollama");
        assert_eq!(parsed.model, "llama3.2");
        assert_eq!(parsed.concurrency, Some(3));
    }

    #[test]
    fn legacy_remote_prefix_ignores_concurrency_split() {
        let parsed = parse("kimi/kimi-k2:1");
        assert_eq!(parsed.provider, "kimi");
        assert_eq!(parsed.model, "kimi-k2:1");
        assert_eq!(parsed.concurrency, None);
    }

    // ── Native detection ──────────────────────────────────────────────────

    #[test]
    fn native_patterns() {
        assert_eq!(parse("gemini-2.5-flash").provider, "google");
        assert_eq!(parse("gpt-4o").provider, "openai");
        assert_eq!(parse("o3-mini").provider, "openai");
        assert_eq!(parse("chatgpt-4o-latest").provider, "openai");
        assert_eq!(parse("minimax-m2").provider, "minimax");
        assert_eq!(parse("abab-6.5s").provider, "minimax");
        assert_eq!(parse("glm-4.6").provider, "glm");
        assert_eq!(parse("chatglm-3").provider, "glm");
        assert_eq!(parse("llama-4-maverick").provider, "ollamacloud");
        assert_eq!(parse("llama3.3").provider, "ollamacloud");
        assert_eq!(parse("claude-sonnet-4").provider, PROVIDER_NATIVE_ANTHROPIC);
    }

    #[test]
    fn vendor_prefix_is_stripped() {
        let parsed = parse("google/gemini-2.5-pro");
        assert_eq!(parsed.provider, "google");
        assert_eq!(parsed.model, "gemini-2.5-pro");
        let parsed = parse("meta-llama/llama-4-scout");
        assert_eq!(parsed.provider, "ollamacloud");
        assert_eq!(parsed.model, "llama-4-scout");
    }

    #[test]
    fn kimi_for_coding_wins_over_kimi_dash() {
        assert_eq!(parse("kimi-for-coding").provider, "kimi-coding");
        assert_eq!(parse("kimi-k2-thinking").provider, "kimi");
    }

    #[test]
    fn poe_colon_prefix() {
        let parsed = parse("poe:Claude-Sonnet-4.5");
        assert_eq!(parsed.provider, "poe");
        assert_eq!(parsed.model, "Claude-Sonnet-4.5");
    }

    // ── Fallthrough ───────────────────────────────────────────────────────

    #[test]
    fn custom_url() {
        let parsed = parse("http://localhost:8080/v1");
        assert_eq!(parsed.provider, PROVIDER_CUSTOM_URL);
        assert_eq!(parsed.model, "http://localhost:8080/v1");
    }

    #[test]
    fn unknown_vendor_slash() {
        let parsed = parse("acme/super-1");
        assert_eq!(parsed.provider, PROVIDER_UNKNOWN);
        assert_eq!(parsed.model, "acme/super-1");
    }

    #[test]
    fn bare_name_defaults_to_native_anthropic() {
        let parsed = parse("claude-3-5-haiku-latest");
        assert_eq!(parsed.provider, PROVIDER_NATIVE_ANTHROPIC);
        let parsed = parse("sonnet");
        assert_eq!(parsed.provider, PROVIDER_NATIVE_ANTHROPIC);
    }

    // ── Totality / round trip ─────────────────────────────────────────────

    #[test]
    fn parse_is_total_on_odd_inputs() {
        for s in ["", "@", "a@", "@b", ":::", "  ", "\u{1F980}", "a@b@c"] {
            let parsed = parse(s);
            assert!(!parsed.provider.is_empty(), "input {s:?}");
        }
    }

    #[test]
    fn canonical_round_trip() {
        for spec in [
            "google@gemini-2.5-pro",
            "openai@gpt-4o",
            "ollama@qwen3:2",
            "lmstudio@devstral:0",
            "ollamacloud@llama-4-maverick",
        ] {
            let parsed = parse(spec);
            let reparsed = parse(&parsed.canonical_spec());
            assert_eq!(parsed.provider, reparsed.provider);
            assert_eq!(parsed.model, reparsed.model);
            assert_eq!(parsed.concurrency, reparsed.concurrency);
        }
    }
}
