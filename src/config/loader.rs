//! Environment-driven configuration loading.
//!
//! The proxy has no config file of its own; the host CLI owns on-disk
//! profiles and hands everything down through the environment.
//!
//! Supported variables:
//! - `CLAUDISH_PORT`                    → `port`
//! - `CLAUDISH_MODEL`                   → `models.default`
//! - `CLAUDISH_MODEL_OPUS`              → `models.opus`
//! - `CLAUDISH_MODEL_SONNET`            → `models.sonnet`
//! - `CLAUDISH_MODEL_HAIKU`             → `models.haiku`
//! - `CLAUDISH_MODEL_SUBAGENT`          → `models.subagent`
//! - `CLAUDISH_SUBAGENT_MARKER`         → `models.subagent_marker`
//! - `CLAUDISH_LOCAL_MAX_PARALLEL`      → `queue.local_max_parallel` (clamped to [1,8])
//! - `CLAUDISH_LOCAL_QUEUE_ENABLED`     → `queue.local_queue_enabled` (1/0)
//! - `CLAUDISH_CONTEXT_DROP_THRESHOLD`  → `billing.context_drop_threshold`
//! - `OLLAMA_BASE_URL`, `LMSTUDIO_BASE_URL`, `VLLM_BASE_URL`, `MLX_BASE_URL`,
//!   `OPENAI_BASE_URL`, `GEMINI_BASE_URL`, `OLLAMACLOUD_BASE_URL`,
//!   `OPENCODE_BASE_URL`               → `base_urls.*`

use std::env;

use super::schema::ProxyConfig;

/// Load a [`ProxyConfig`] from defaults plus environment overrides.
pub fn load_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    apply_env_overrides(&mut config);
    config
}

fn env_nonempty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(var: &str) -> Option<bool> {
    env::var(var)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Apply environment variable overrides to `config`.
pub fn apply_env_overrides(config: &mut ProxyConfig) {
    if let Some(v) = env_nonempty("CLAUDISH_PORT") {
        if let Ok(port) = v.parse::<u16>() {
            config.port = port;
        }
    }
    if let Some(v) = env_nonempty("CLAUDISH_MODEL") {
        config.models.default = Some(v);
    }
    if let Some(v) = env_nonempty("CLAUDISH_MODEL_OPUS") {
        config.models.opus = Some(v);
    }
    if let Some(v) = env_nonempty("CLAUDISH_MODEL_SONNET") {
        config.models.sonnet = Some(v);
    }
    if let Some(v) = env_nonempty("CLAUDISH_MODEL_HAIKU") {
        config.models.haiku = Some(v);
    }
    if let Some(v) = env_nonempty("CLAUDISH_MODEL_SUBAGENT") {
        config.models.subagent = Some(v);
    }
    if let Some(v) = env_nonempty("CLAUDISH_SUBAGENT_MARKER") {
        config.models.subagent_marker = Some(v);
    }
    if let Some(v) = env_nonempty("CLAUDISH_LOCAL_MAX_PARALLEL") {
        if let Ok(n) = v.parse::<usize>() {
            config.queue.local_max_parallel = n.clamp(1, 8);
        }
    }
    if let Some(v) = env_flag("CLAUDISH_LOCAL_QUEUE_ENABLED") {
        config.queue.local_queue_enabled = v;
    }
    if let Some(v) = env_nonempty("CLAUDISH_CONTEXT_DROP_THRESHOLD") {
        if let Ok(t) = v.parse::<f64>() {
            if (0.0..1.0).contains(&t) {
                config.billing.context_drop_threshold = t;
            }
        }
    }

    config.base_urls.ollama = env_nonempty("OLLAMA_BASE_URL");
    config.base_urls.lmstudio = env_nonempty("LMSTUDIO_BASE_URL");
    config.base_urls.vllm = env_nonempty("VLLM_BASE_URL");
    config.base_urls.mlx = env_nonempty("MLX_BASE_URL");
    config.base_urls.openai = env_nonempty("OPENAI_BASE_URL");
    config.base_urls.gemini = env_nonempty("GEMINI_BASE_URL");
    config.base_urls.ollamacloud = env_nonempty("OLLAMACLOUD_BASE_URL");
    config.base_urls.opencode = env_nonempty("OPENCODE_BASE_URL");
}
