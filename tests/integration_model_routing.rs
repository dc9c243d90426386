// Integration tests for model parsing, provider resolution and pricing.
// Run with: cargo test --test integration_model_routing

use claudish::model::{parse, resolve, Category, MapCredentials};
use claudish::pricing::PricingRegistry;

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Parser properties
    // =========================================================================

    #[test]
    fn parser_is_total() {
        let inputs = [
            "",
            "@",
            "g@",
            "@model",
            "http://",
            "https://x",
            "a/b/c/d",
            "::::",
            "ollama@m:0:0",
            "\tg@gemini-2.5-pro",
            "ＵＮＩＣＯＤＥ",
            // Lowercases to an ASCII prefix with a different byte length.
            "\u{212A}imi-k2-thinking",
        ];
        for input in inputs {
            let parsed = parse(input);
            assert!(!parsed.provider.is_empty(), "empty provider for {input:?}");
            assert_eq!(parsed.original, input);
        }
    }

    #[test]
    fn parser_ordering_kimi_for_coding() {
        assert_eq!(parse("kimi-for-coding").provider, "kimi-coding");
        assert_eq!(parse("kimi-k2-thinking").provider, "kimi");
    }

    #[test]
    fn shortcut_canonicalization_round_trips() {
        // Each shortcut's canonical provider parses back to itself.
        let shortcuts = [
            "g", "gemini", "oai", "or", "mm", "mmax", "kimi", "moon", "moonshot", "kc", "glm",
            "zhipu", "zai", "oc", "llama", "lc", "meta", "zen", "v", "vertex", "go", "poe",
            "ollama", "lms", "lmstudio", "mlstudio", "vllm", "mlx",
        ];
        for shortcut in shortcuts {
            let canonical = parse(&format!("{shortcut}@m")).provider;
            assert_eq!(
                parse(&format!("{canonical}@m")).provider,
                canonical,
                "shortcut {shortcut}"
            );
        }
    }

    #[test]
    fn canonical_spec_round_trips() {
        for spec in [
            "google@gemini-3-pro-preview",
            "openai@gpt-4o",
            "openrouter@deepseek/deepseek-v3",
            "ollama@qwen3:32b:2",
            "lmstudio@devstral:0",
        ] {
            let parsed = parse(spec);
            let reparsed = parse(&parsed.canonical_spec());
            assert_eq!(parsed.provider, reparsed.provider, "{spec}");
            assert_eq!(parsed.model, reparsed.model, "{spec}");
            assert_eq!(parsed.concurrency, reparsed.concurrency, "{spec}");
        }
    }

    // =========================================================================
    // Resolver fallback chain
    // =========================================================================

    #[test]
    fn openrouter_fallback_for_missing_gemini_key() {
        let creds = MapCredentials::new(&[("OPENROUTER_API_KEY", "sk-or")]);
        let res = resolve(Some("g@gemini-3-pro-preview"), &creds);
        assert_eq!(res.category, Category::OpenRouter);
        assert!(res.provider_name.contains("fallback"));
        assert_eq!(res.model_name, "gemini-3-pro-preview");
    }

    #[test]
    fn missing_everything_surfaces_the_env_var() {
        let creds = MapCredentials::default();
        let res = resolve(Some("g@gemini-3-pro-preview"), &creds);
        assert_eq!(res.category, Category::DirectApi);
        assert!(!res.credential_available);
        assert_eq!(
            res.required_credential_env_var.as_deref(),
            Some("GEMINI_API_KEY")
        );
    }

    #[test]
    fn direct_key_wins_over_openrouter() {
        let creds = MapCredentials::new(&[
            ("GEMINI_API_KEY", "g"),
            ("OPENROUTER_API_KEY", "sk-or"),
        ]);
        let res = resolve(Some("g@gemini-3-pro-preview"), &creds);
        assert_eq!(res.category, Category::DirectApi);
        assert_eq!(res.provider, "google");
    }

    #[test]
    fn unknown_vendor_resolution() {
        let res = resolve(Some("acme/super-1"), &MapCredentials::default());
        assert_eq!(res.category, Category::Unknown);
    }

    // =========================================================================
    // Pricing
    // =========================================================================

    #[test]
    fn cost_additivity() {
        let registry = PricingRegistry::new();
        for (a, b, c, d) in [(1u64, 2u64, 3u64, 4u64), (1_000_000, 0, 0, 1_000_000), (7, 11, 13, 17)] {
            let joint = registry.cost("openrouter", "m", a + c, b + d);
            let split = registry.cost("openrouter", "m", a, b) + registry.cost("openrouter", "m", c, d);
            assert!((joint - split).abs() < 1e-9);
        }
    }

    #[test]
    fn free_and_subscription_sets() {
        let registry = PricingRegistry::new();
        assert!(registry.lookup("opencode-zen", "any").is_free);
        assert!(registry.lookup("zen", "any").is_free);
        assert!(registry.lookup("kimi-coding", "kimi-for-coding").is_subscription);
        assert_eq!(registry.cost("opencode-zen", "any", 1_000_000, 1_000_000), 0.0);
    }
}
