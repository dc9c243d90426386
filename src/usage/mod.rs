//! Per-session token and cost accounting.
//!
//! Each handler owns one [`SessionUsage`]. Most upstreams report the full
//! prompt size every turn, so input billing is incremental against the
//! previous total; Gemini and Ollama report absolute per-turn counts and use
//! [`SessionUsage::record_absolute`] instead.
//!
//! After every update the accountant writes a snapshot to
//! `<dir>/tokens-<port>.json` so the host CLI's status line can poll it.
//! Writes are best-effort: a failed write is logged at debug and forgotten.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::pricing::PricingRegistry;

/// Default accounting directory: `~/.claudish`.
pub fn default_usage_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".claudish")
}

/// Rough context window per provider/model, for the `context_left_percent`
/// figure in the snapshot file.
pub fn context_window_for(provider: &str, model: &str) -> u64 {
    let lower = model.to_lowercase();
    match provider {
        "google" | "vertex" | "gemini-codeassist" => 1_048_576,
        "openai" => {
            if lower.contains("gpt-4.1") {
                1_047_576
            } else if lower.contains("gpt-5") || lower.starts_with("o3") || lower.starts_with("o4")
            {
                200_000
            } else {
                128_000
            }
        }
        "kimi" | "kimi-coding" => 262_144,
        "minimax" => 1_000_000,
        "glm" | "zai" => 131_072,
        "ollamacloud" => 131_072,
        _ => {
            if lower.contains("gemini") {
                1_048_576
            } else {
                200_000
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    input_cumulative: u64,
    output_cumulative: u64,
    cost_usd: f64,
}

/// Snapshot of a session's accounting, as written to the tokens file.
#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub context_window: u64,
}

/// Token/cost accountant for one handler instance.
pub struct SessionUsage {
    counters: Mutex<Counters>,
    pricing: Arc<PricingRegistry>,
    provider: String,
    provider_name: String,
    model: String,
    context_window: u64,
    drop_threshold: f64,
    port: u16,
    dir: PathBuf,
}

impl SessionUsage {
    pub fn new(
        pricing: Arc<PricingRegistry>,
        provider: &str,
        provider_name: &str,
        model: &str,
        port: u16,
        dir: PathBuf,
        drop_threshold: f64,
    ) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            pricing,
            provider: provider.to_string(),
            provider_name: provider_name.to_string(),
            model: model.to_string(),
            context_window: context_window_for(provider, model),
            drop_threshold,
            port,
            dir,
        }
    }

    /// Record a turn whose upstream reports the full prompt size so far.
    ///
    /// - Growth is billed incrementally and the new total stored.
    /// - A report smaller than `threshold × previous` is a concurrent,
    ///   unrelated conversation: billed as-is, total left untouched.
    /// - Anything in between is ambiguous: billed as-is and stored.
    pub fn record_incremental(&self, reported_input: u64, output: u64) {
        {
            let Ok(mut counters) = self.counters.lock() else {
                return;
            };
            let prev = counters.input_cumulative;
            let billed = if reported_input >= prev {
                counters.input_cumulative = reported_input;
                reported_input - prev
            } else if (reported_input as f64) < prev as f64 * self.drop_threshold {
                log::debug!(
                    "[Usage] {} reported {reported_input} < {}x{prev}; billing as concurrent session",
                    self.model,
                    self.drop_threshold
                );
                reported_input
            } else {
                counters.input_cumulative = reported_input;
                reported_input
            };
            counters.output_cumulative += output;
            counters.cost_usd += self
                .pricing
                .cost(&self.provider, &self.model, billed, output);
        }
        self.flush();
    }

    /// Record a turn whose upstream reports absolute per-turn counts
    /// (Gemini, Ollama).
    pub fn record_absolute(&self, input: u64, output: u64) {
        {
            let Ok(mut counters) = self.counters.lock() else {
                return;
            };
            counters.input_cumulative += input;
            counters.output_cumulative += output;
            counters.cost_usd += self.pricing.cost(&self.provider, &self.model, input, output);
        }
        self.flush();
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let counters = self
            .counters
            .lock()
            .map(|c| *c)
            .unwrap_or_default();
        UsageSnapshot {
            input_tokens: counters.input_cumulative,
            output_tokens: counters.output_cumulative,
            cost_usd: counters.cost_usd,
            context_window: self.context_window,
        }
    }

    /// Write the snapshot file. Best-effort by design.
    pub fn flush(&self) {
        let snapshot = self.snapshot();
        let total = snapshot.input_tokens + snapshot.output_tokens;
        let ctx = snapshot.context_window.max(1);
        let left = ((ctx.saturating_sub(total)) as f64 / ctx as f64 * 100.0).round();
        let pricing = self.pricing.lookup(&self.provider, &self.model);

        let mut body = json!({
            "input_tokens": snapshot.input_tokens,
            "output_tokens": snapshot.output_tokens,
            "total_tokens": total,
            "total_cost": snapshot.cost_usd,
            "context_window": snapshot.context_window,
            "context_left_percent": (left as i64).clamp(0, 100),
            "updated_at": epoch_millis(),
            "provider_name": self.provider_name,
            "model_name": self.model,
        });
        if pricing.is_estimate {
            body["cost_is_estimate"] = json!(true);
        }
        if pricing.is_free {
            body["is_free"] = json!(true);
        }
        if pricing.is_subscription {
            body["is_subscription"] = json!(true);
        }

        let path = self.dir.join(format!("tokens-{}.json", self.port));
        if let Err(err) = std::fs::create_dir_all(&self.dir)
            .and_then(|_| std::fs::write(&path, body.to_string()))
        {
            log::debug!("[Usage] could not write {}: {err}", path.display());
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
