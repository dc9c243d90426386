//! Per-token pricing.
//!
//! Maps `(provider, model)` to per-million-token input/output prices. The
//! static table here only carries per-provider estimates; a live catalog can
//! register a dynamic lookup at startup via
//! [`PricingRegistry::register_dynamic_lookup`] — the registry holds just the
//! function, never an import of whoever produced it.

use std::sync::RwLock;

/// Pricing for one model, USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    /// True when this is a per-provider default, not a catalog figure.
    pub is_estimate: bool,
    /// Free tier: no cost accrues.
    pub is_free: bool,
    /// Flat-rate subscription: no per-request cost accrues.
    pub is_subscription: bool,
}

impl ModelPricing {
    fn estimate(input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            input_per_1m,
            output_per_1m,
            is_estimate: true,
            is_free: false,
            is_subscription: false,
        }
    }

    fn free() -> Self {
        Self {
            input_per_1m: 0.0,
            output_per_1m: 0.0,
            is_estimate: false,
            is_free: true,
            is_subscription: false,
        }
    }

    fn subscription() -> Self {
        Self {
            input_per_1m: 0.0,
            output_per_1m: 0.0,
            is_estimate: false,
            is_free: false,
            is_subscription: true,
        }
    }
}

/// Providers whose usage never costs anything per-token.
const FREE_PROVIDERS: &[&str] = &["opencode-zen", "zen"];

/// Providers billed as a flat subscription.
const SUBSCRIPTION_PROVIDERS: &[&str] = &["kimi-coding"];

type DynamicLookup = Box<dyn Fn(&str, &str) -> Option<ModelPricing> + Send + Sync>;

/// Pricing registry with an optional dynamic catalog hook.
#[derive(Default)]
pub struct PricingRegistry {
    dynamic: RwLock<Option<DynamicLookup>>,
}

impl PricingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the dynamic catalog lookup. Called once at startup by
    /// whoever warms the catalog; later registrations replace earlier ones.
    pub fn register_dynamic_lookup(
        &self,
        lookup: impl Fn(&str, &str) -> Option<ModelPricing> + Send + Sync + 'static,
    ) {
        if let Ok(mut slot) = self.dynamic.write() {
            *slot = Some(Box::new(lookup));
        }
    }

    /// Resolve pricing for `(provider, model)`.
    pub fn lookup(&self, provider: &str, model: &str) -> ModelPricing {
        if FREE_PROVIDERS.contains(&provider) {
            return ModelPricing::free();
        }
        if SUBSCRIPTION_PROVIDERS.contains(&provider) {
            return ModelPricing::subscription();
        }
        if let Ok(slot) = self.dynamic.read() {
            if let Some(lookup) = slot.as_ref() {
                if let Some(pricing) = lookup(provider, model) {
                    return pricing;
                }
            }
        }
        default_estimate(provider)
    }

    /// Cost in USD for a token delta.
    pub fn cost(&self, provider: &str, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let pricing = self.lookup(provider, model);
        input_tokens as f64 / 1e6 * pricing.input_per_1m
            + output_tokens as f64 / 1e6 * pricing.output_per_1m
    }
}

/// Per-provider defaults, marked as estimates. Rough blended figures for
/// each provider's current flagship tier.
fn default_estimate(provider: &str) -> ModelPricing {
    match provider {
        "google" | "vertex" | "gemini-codeassist" => ModelPricing::estimate(1.25, 10.0),
        "openai" => ModelPricing::estimate(1.25, 10.0),
        "openrouter" => ModelPricing::estimate(3.0, 15.0),
        "minimax" => ModelPricing::estimate(0.3, 1.2),
        "kimi" => ModelPricing::estimate(0.6, 2.5),
        "glm" => ModelPricing::estimate(0.6, 2.2),
        "zai" => ModelPricing::estimate(0.6, 2.2),
        "ollamacloud" => ModelPricing::estimate(0.0, 0.0),
        "poe" => ModelPricing::estimate(3.0, 15.0),
        // Local inference is free.
        "ollama" | "lmstudio" | "vllm" | "mlx" | "custom-url" => {
            ModelPricing::estimate(0.0, 0.0)
        }
        _ => ModelPricing::estimate(0.0, 0.0),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
