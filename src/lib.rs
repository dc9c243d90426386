//! Claudish — a local Anthropic Messages proxy.
//!
//! Accepts Anthropic-shaped requests on `localhost`, routes each one to an
//! upstream chat API chosen from the model spec (OpenAI, Gemini, OpenRouter,
//! OllamaCloud, MiniMax, Kimi, GLM, Z.AI, Poe, OpenCode Zen, or a local
//! server), streams the reply back as Anthropic SSE, and accounts tokens and
//! cost per session. A secondary bridge mode exposes a token-authenticated
//! control plane for a host UI.

pub mod anthropic;
pub mod app;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handlers;
pub mod model;
pub mod pricing;
pub mod queue;
pub mod server;
pub mod usage;

/// Convenience re-exports for the most commonly used types across the
/// codebase.
///
/// ```rust
/// use claudish::prelude::*;
/// ```
pub mod prelude {
    // Request model and SSE emission
    pub use crate::anthropic::{MessagesRequest, SseEmitter, StopReason};

    // Routing
    pub use crate::model::{parse, resolve, Category, ParsedModel, Resolution};
    pub use crate::model::{CredentialSource, EnvCredentials, MapCredentials};

    // Scheduling
    pub use crate::queue::{GeminiQueue, LocalQueue};

    // Accounting
    pub use crate::pricing::{ModelPricing, PricingRegistry};
    pub use crate::usage::SessionUsage;

    // Errors
    pub use crate::error::{ProxyError, Result};

    // Configuration and state
    pub use crate::app::AppState;
    pub use crate::config::{load_config, ProxyConfig};
}
