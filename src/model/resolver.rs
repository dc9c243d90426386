//! Provider resolution.
//!
//! Combines a [`ParsedModel`] with credential presence to decide which
//! upstream actually serves the request: the provider's own API, OpenRouter
//! as a fallback, Vertex as a second fallback, a local server, or the
//! embedding runtime itself for native Anthropic models.

use serde::Serialize;

use super::credentials::{credential_available, provider_info, CredentialSource};
use super::parser::{
    parse, ParsedModel, PROVIDER_CUSTOM_URL, PROVIDER_NATIVE_ANTHROPIC, PROVIDER_UNKNOWN,
};

/// Upstream category a request is dispatched under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Local OpenAI-compatible server (Ollama, LM Studio, vLLM, MLX, raw URL).
    Local,
    /// The provider's own API.
    DirectApi,
    /// Routed through OpenRouter.
    OpenRouter,
    /// Left to the embedding Anthropic runtime.
    NativeAnthropic,
    /// Could not be attributed to any provider.
    Unknown,
}

/// Fully resolved routing decision for one model spec.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub category: Category,
    /// Canonical provider key (`google`, `openai`, `openrouter`, ...).
    pub provider: String,
    /// Display name; carries a "(fallback)" suffix when rerouted.
    pub provider_name: String,
    /// Upstream-facing model id.
    pub model_name: String,
    /// The id a human would use to refer to this exact route.
    pub full_model_id: String,
    pub required_credential_env_var: Option<String>,
    pub credential_available: bool,
    pub credential_description: String,
    pub credential_url: String,
    pub concurrency: Option<usize>,
    pub is_legacy_syntax: bool,
    pub deprecation_warning: Option<String>,
}

impl Resolution {
    fn base(parsed: &ParsedModel) -> Self {
        Self {
            category: Category::Unknown,
            provider: parsed.provider.clone(),
            provider_name: parsed.provider.clone(),
            model_name: parsed.model.clone(),
            full_model_id: parsed.canonical_spec(),
            required_credential_env_var: None,
            credential_available: false,
            credential_description: String::new(),
            credential_url: String::new(),
            concurrency: parsed.concurrency,
            is_legacy_syntax: parsed.is_legacy_syntax,
            deprecation_warning: deprecation_warning(parsed),
        }
    }
}

fn deprecation_warning(parsed: &ParsedModel) -> Option<String> {
    if parsed.is_legacy_syntax {
        Some(format!(
            "The '{}' prefix syntax is deprecated; use '{}@{}' instead",
            parsed.original.split(['/', ':']).next().unwrap_or(""),
            parsed.provider,
            parsed.model,
        ))
    } else {
        None
    }
}

/// Resolve a model spec against the available credentials.
///
/// `None` means "no model requested" and routes to OpenRouter with an empty
/// model, letting the caller pick a default later.
pub fn resolve(spec: Option<&str>, creds: &dyn CredentialSource) -> Resolution {
    let Some(spec) = spec else {
        let parsed = ParsedModel {
            provider: "openrouter".into(),
            model: String::new(),
            original: String::new(),
            concurrency: None,
            is_legacy_syntax: false,
            is_explicit_provider: false,
        };
        let mut res = Resolution::base(&parsed);
        res.category = Category::OpenRouter;
        res.provider_name = "OpenRouter".into();
        res.full_model_id = String::new();
        fill_credential(&mut res, "openrouter", creds);
        return res;
    };

    resolve_parsed(&parse(spec), creds)
}

fn openrouter_available(creds: &dyn CredentialSource) -> bool {
    provider_info("openrouter")
        .map(|info| credential_available(info, creds))
        .unwrap_or(false)
}

fn vertex_available(creds: &dyn CredentialSource) -> bool {
    provider_info("vertex")
        .map(|info| credential_available(info, creds))
        .unwrap_or(false)
}

/// Resolve an already-parsed model.
pub fn resolve_parsed(parsed: &ParsedModel, creds: &dyn CredentialSource) -> Resolution {
    let mut res = Resolution::base(parsed);

    match parsed.provider.as_str() {
        PROVIDER_CUSTOM_URL => {
            res.category = Category::Local;
            res.provider_name = "Custom endpoint".into();
            res.credential_available = true;
        }
        PROVIDER_NATIVE_ANTHROPIC => {
            res.category = Category::NativeAnthropic;
            res.provider_name = "Anthropic".into();
            res.credential_available = true;
            res.full_model_id = parsed.model.clone();
        }
        "ollama" | "lmstudio" | "vllm" | "mlx" => {
            res.category = Category::Local;
            res.provider_name = local_display(&parsed.provider).into();
            res.credential_available = true;
        }
        "openrouter" => {
            res.category = Category::OpenRouter;
            res.provider_name = "OpenRouter".into();
            fill_credential(&mut res, "openrouter", creds);
        }
        PROVIDER_UNKNOWN => {
            res.category = Category::Unknown;
        }
        direct => {
            resolve_direct(&mut res, direct, parsed, creds);
        }
    }

    res
}

fn local_display(provider: &str) -> &'static str {
    match provider {
        "ollama" => "Ollama",
        "lmstudio" => "LM Studio",
        "vllm" => "vLLM",
        "mlx" => "MLX",
        _ => "Local",
    }
}

fn fill_credential(res: &mut Resolution, canonical: &str, creds: &dyn CredentialSource) {
    if let Some(info) = provider_info(canonical) {
        res.required_credential_env_var = if info.env_var.is_empty() {
            None
        } else {
            Some(info.env_var.to_string())
        };
        res.credential_available = credential_available(info, creds);
        res.credential_description = info.description.to_string();
        res.credential_url = info.url.to_string();
    }
}

/// Direct-API providers, with the documented fallback chain:
/// own credential → OpenRouter → Vertex → missing-credential surface.
fn resolve_direct(
    res: &mut Resolution,
    canonical: &str,
    parsed: &ParsedModel,
    creds: &dyn CredentialSource,
) {
    let Some(info) = provider_info(canonical) else {
        // Explicit syntax with an unregistered provider name.
        res.category = Category::Unknown;
        return;
    };

    if credential_available(info, creds) {
        res.category = Category::DirectApi;
        res.provider_name = info.display.to_string();
        fill_credential(res, canonical, creds);
        return;
    }

    if openrouter_available(creds) {
        log::info!(
            "[Resolver] No {} credential; routing {} via OpenRouter",
            info.display,
            parsed.model
        );
        res.category = Category::OpenRouter;
        res.provider = "openrouter".into();
        res.provider_name = format!("OpenRouter ({} fallback)", info.display);
        // Keep the original model id; OpenRouter understands vendor-prefixed ids.
        res.model_name = parsed.model.clone();
        fill_credential(res, "openrouter", creds);
        return;
    }

    if canonical != "vertex" && vertex_available(creds) {
        log::info!(
            "[Resolver] No {} credential; routing {} via Vertex AI",
            info.display,
            parsed.model
        );
        res.category = Category::DirectApi;
        res.provider = "vertex".into();
        res.provider_name = format!("Vertex AI ({} fallback)", info.display);
        res.model_name = parsed.model.clone();
        fill_credential(res, "vertex", creds);
        return;
    }

    res.category = Category::DirectApi;
    res.provider_name = info.display.to_string();
    fill_credential(res, canonical, creds);
    // credential_available is false here; the server surfaces the error.
}

// ─── Tests ────────────────────────────────────────────────────────────────────
