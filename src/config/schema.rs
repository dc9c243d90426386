//! Configuration schema for the proxy.
//!
//! Everything here is populated from the environment (see `loader.rs`);
//! config files on disk belong to the host CLI, not to the core. All
//! sections carry `Default` impls so a bare environment still yields a
//! working proxy.

use serde::{Deserialize, Serialize};

// ─── ModelMap ─────────────────────────────────────────────────────────────────

/// Role-to-model mapping applied before routing.
///
/// The embedding runtime asks for models by role keyword (`opus`, `sonnet`,
/// `haiku`) or with a subagent marker; each role can be redirected to a
/// different model spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelMap {
    /// Model spec used when no role-specific override matches.
    pub default: Option<String>,
    /// Override for `opus`-class requests.
    pub opus: Option<String>,
    /// Override for `sonnet`-class requests.
    pub sonnet: Option<String>,
    /// Override for `haiku`-class requests.
    pub haiku: Option<String>,
    /// Override for subagent requests (matched by marker substring).
    pub subagent: Option<String>,
    /// Substring marking a subagent request, supplied by the host runtime.
    pub subagent_marker: Option<String>,
}

impl ModelMap {
    /// Apply the mapping to a requested model string.
    ///
    /// Subagent marker wins over role keywords; an unmatched request falls
    /// back to `default`, and absent that, passes through unchanged.
    pub fn apply<'a>(&'a self, requested: &'a str) -> &'a str {
        let lower = requested.to_lowercase();
        if let Some(marker) = &self.subagent_marker {
            if !marker.is_empty() && lower.contains(&marker.to_lowercase()) {
                if let Some(m) = &self.subagent {
                    return m;
                }
            }
        }
        let role = if lower.contains("opus") {
            self.opus.as_ref()
        } else if lower.contains("sonnet") {
            self.sonnet.as_ref()
        } else if lower.contains("haiku") {
            self.haiku.as_ref()
        } else {
            None
        };
        role.or(self.default.as_ref())
            .map(String::as_str)
            .unwrap_or(requested)
    }
}

// ─── QueueConfig ──────────────────────────────────────────────────────────────

/// Local GPU queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum parallel local-model requests, clamped to `[1, 8]`.
    pub local_max_parallel: usize,
    /// Whether local requests are gated through the queue at all.
    pub local_queue_enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            local_max_parallel: 1,
            local_queue_enabled: true,
        }
    }
}

// ─── BillingConfig ────────────────────────────────────────────────────────────

/// Session-accounting tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BillingConfig {
    /// Ratio below which a smaller reported prompt size is treated as a
    /// concurrent, unrelated conversation (billed but not stored).
    pub context_drop_threshold: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            context_drop_threshold: 0.5,
        }
    }
}

// ─── BaseUrls ─────────────────────────────────────────────────────────────────

/// Overridable upstream base URLs. `None` means the provider default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BaseUrls {
    pub ollama: Option<String>,
    pub lmstudio: Option<String>,
    pub vllm: Option<String>,
    pub mlx: Option<String>,
    pub openai: Option<String>,
    pub gemini: Option<String>,
    pub ollamacloud: Option<String>,
    pub opencode: Option<String>,
}

// ─── ProxyConfig ──────────────────────────────────────────────────────────────

/// Top-level configuration for a proxy instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port the Messages endpoint listens on. `0` lets the OS pick.
    pub port: u16,
    /// Role-to-model mapping.
    pub models: ModelMap,
    /// Local queue tuning.
    pub queue: QueueConfig,
    /// Session-accounting tuning.
    pub billing: BillingConfig,
    /// Upstream base URL overrides.
    pub base_urls: BaseUrls,
}
