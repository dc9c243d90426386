//! Provider credential registry.
//!
//! Maps each remote provider to the environment variable (plus aliases)
//! holding its API key, together with the human-facing description and
//! signup URL used in `missing_credential` errors. The resolver never reads
//! the process environment directly; it goes through [`CredentialSource`] so
//! tests can inject a fixed map.

use std::collections::HashMap;

/// Abstract "is this value present" view over credentials.
pub trait CredentialSource: Send + Sync {
    /// Return the value of `var`, if set and non-empty.
    fn get(&self, var: &str) -> Option<String>;
}

/// Production source: the process environment.
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn get(&self, var: &str) -> Option<String> {
        std::env::var(var).ok().filter(|v| !v.trim().is_empty())
    }
}

/// Fixed map source for tests and the bridge's credential bag.
#[derive(Default)]
pub struct MapCredentials(pub HashMap<String, String>);

impl MapCredentials {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl CredentialSource for MapCredentials {
    fn get(&self, var: &str) -> Option<String> {
        self.0.get(var).cloned().filter(|v| !v.trim().is_empty())
    }
}

/// Layered source: overrides first, then a base source. The bridge stacks a
/// credential bag from the host UI on top of the environment.
pub struct LayeredCredentials<A, B> {
    pub overrides: A,
    pub base: B,
}

impl<A: CredentialSource, B: CredentialSource> CredentialSource for LayeredCredentials<A, B> {
    fn get(&self, var: &str) -> Option<String> {
        self.overrides.get(var).or_else(|| self.base.get(var))
    }
}

// ─── Provider registry ────────────────────────────────────────────────────────

/// Static description of a remote provider's credential.
#[derive(Debug, Clone, Copy)]
pub struct ProviderInfo {
    /// Canonical provider key as produced by the parser.
    pub canonical: &'static str,
    /// Human-facing provider name.
    pub display: &'static str,
    /// Primary env var; empty means always-available (OAuth / free tier).
    pub env_var: &'static str,
    /// Alias env vars that count as the same credential.
    pub aliases: &'static [&'static str],
    /// Human description of the credential.
    pub description: &'static str,
    /// Where to obtain the key.
    pub url: &'static str,
}

/// Registry of direct-API providers.
pub const PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        canonical: "google",
        display: "Google Gemini",
        env_var: "GEMINI_API_KEY",
        aliases: &[],
        description: "Google AI Studio API key",
        url: "https://aistudio.google.com/apikey",
    },
    ProviderInfo {
        canonical: "openai",
        display: "OpenAI",
        env_var: "OPENAI_API_KEY",
        aliases: &[],
        description: "OpenAI platform API key",
        url: "https://platform.openai.com/api-keys",
    },
    ProviderInfo {
        canonical: "openrouter",
        display: "OpenRouter",
        env_var: "OPENROUTER_API_KEY",
        aliases: &[],
        description: "OpenRouter API key",
        url: "https://openrouter.ai/keys",
    },
    ProviderInfo {
        canonical: "minimax",
        display: "MiniMax",
        env_var: "MINIMAX_API_KEY",
        aliases: &[],
        description: "MiniMax platform API key",
        url: "https://platform.minimax.io/user-center/basic-information/interface-key",
    },
    ProviderInfo {
        canonical: "kimi",
        display: "Kimi (Moonshot)",
        env_var: "MOONSHOT_API_KEY",
        aliases: &["KIMI_API_KEY"],
        description: "Moonshot platform API key",
        url: "https://platform.moonshot.ai/console/api-keys",
    },
    ProviderInfo {
        canonical: "kimi-coding",
        display: "Kimi For Coding",
        env_var: "",
        aliases: &[],
        description: "Kimi For Coding subscription (OAuth)",
        url: "https://www.kimi.com/coding",
    },
    ProviderInfo {
        canonical: "glm",
        display: "GLM (Zhipu)",
        env_var: "ZHIPU_API_KEY",
        aliases: &["GLM_API_KEY"],
        description: "Zhipu BigModel API key",
        url: "https://open.bigmodel.cn/usercenter/apikeys",
    },
    ProviderInfo {
        canonical: "zai",
        display: "Z.AI",
        env_var: "ZAI_API_KEY",
        aliases: &[],
        description: "Z.AI API key",
        url: "https://z.ai/manage-apikey/apikey-list",
    },
    ProviderInfo {
        canonical: "vertex",
        display: "Vertex AI",
        env_var: "VERTEX_API_KEY",
        aliases: &["VERTEX_PROJECT"],
        description: "Vertex AI API key, or VERTEX_PROJECT for OAuth mode",
        url: "https://console.cloud.google.com/vertex-ai",
    },
    ProviderInfo {
        canonical: "gemini-codeassist",
        display: "Gemini Code Assist",
        env_var: "",
        aliases: &[],
        description: "Gemini Code Assist free tier (OAuth)",
        url: "https://codeassist.google",
    },
    ProviderInfo {
        canonical: "ollamacloud",
        display: "OllamaCloud",
        env_var: "OLLAMA_API_KEY",
        aliases: &[],
        description: "Ollama cloud API key",
        url: "https://ollama.com/settings/keys",
    },
    ProviderInfo {
        canonical: "opencode-zen",
        display: "OpenCode Zen",
        env_var: "OPENCODE_API_KEY",
        aliases: &[],
        description: "OpenCode Zen API key",
        url: "https://opencode.ai/zen",
    },
    ProviderInfo {
        canonical: "poe",
        display: "Poe",
        env_var: "POE_API_KEY",
        aliases: &[],
        description: "Poe API key",
        url: "https://poe.com/api_key",
    },
];

/// Look up a provider's registry entry.
pub fn provider_info(canonical: &str) -> Option<&'static ProviderInfo> {
    PROVIDERS.iter().find(|p| p.canonical == canonical)
}

/// Whether a provider's credential is present (or not required at all).
pub fn credential_available(info: &ProviderInfo, creds: &dyn CredentialSource) -> bool {
    if info.env_var.is_empty() {
        return true;
    }
    creds.get(info.env_var).is_some() || info.aliases.iter().any(|a| creds.get(a).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_env_var_is_always_available() {
        let info = provider_info("kimi-coding").expect("registered");
        assert!(credential_available(info, &MapCredentials::default()));
    }

    #[test]
    fn alias_counts_as_credential() {
        let info = provider_info("kimi").expect("registered");
        let creds = MapCredentials::new(&[("KIMI_API_KEY", "sk-test")]);
        assert!(credential_available(info, &creds));

        let info = provider_info("glm").expect("registered");
        let creds = MapCredentials::new(&[("GLM_API_KEY", "sk-test")]);
        assert!(credential_available(info, &creds));
    }

    #[test]
    fn vertex_project_counts_for_oauth_mode() {
        let info = provider_info("vertex").expect("registered");
        let creds = MapCredentials::new(&[("VERTEX_PROJECT", "my-project")]);
        assert!(credential_available(info, &creds));
    }

    #[test]
    fn blank_value_does_not_count() {
        let info = provider_info("openai").expect("registered");
        let creds = MapCredentials::new(&[("OPENAI_API_KEY", "  ")]);
        assert!(!credential_available(info, &creds));
    }

    #[test]
    fn layered_overrides_win() {
        let base = MapCredentials::new(&[("OPENAI_API_KEY", "from-env")]);
        let layered = LayeredCredentials {
            overrides: MapCredentials::new(&[("OPENAI_API_KEY", "from-bridge")]),
            base,
        };
        assert_eq!(layered.get("OPENAI_API_KEY").as_deref(), Some("from-bridge"));
    }
}
