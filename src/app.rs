//! Application state.
//!
//! Everything process-wide lives here instead of in ambient singletons: the
//! two queues, the pricing registry, the outbound HTTP client, and the
//! handler cache. The proxy server holds one `Arc<AppState>` and threads it
//! through axum.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::handlers::{build_handler, http_client, HandlerContext, UpstreamHandler};
use crate::model::credentials::CredentialSource;
use crate::model::resolver::{Category, Resolution};
use crate::model::ParsedModel;
use crate::pricing::PricingRegistry;
use crate::queue::{GeminiQueue, LocalQueue};
use crate::usage::default_usage_dir;

type HandlerKey = (Category, String, String);

/// Shared state for one proxy instance.
pub struct AppState {
    ctx: HandlerContext,
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn UpstreamHandler>>>,
}

impl AppState {
    /// Assemble the state for a bound port.
    pub fn new(
        config: Arc<ProxyConfig>,
        credentials: Arc<dyn CredentialSource>,
        port: u16,
    ) -> Result<Arc<Self>> {
        let ctx = HandlerContext {
            client: http_client()?,
            local_queue: LocalQueue::new(
                config.queue.local_max_parallel,
                config.queue.local_queue_enabled,
            ),
            gemini_queue: GeminiQueue::new(),
            pricing: Arc::new(PricingRegistry::new()),
            credentials,
            config,
            usage_dir: default_usage_dir(),
            port,
        };
        Ok(Arc::new(Self {
            ctx,
            handlers: RwLock::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.ctx.config
    }

    pub fn credentials(&self) -> &dyn CredentialSource {
        self.ctx.credentials.as_ref()
    }

    pub fn pricing(&self) -> &Arc<PricingRegistry> {
        &self.ctx.pricing
    }

    /// Fetch or build the handler for a resolution. Handlers are cached per
    /// `(category, provider, model)` so a session keeps its accounting and
    /// tool-call records across turns.
    pub async fn handler_for(
        &self,
        resolution: &Resolution,
        parsed: &ParsedModel,
    ) -> Result<Arc<dyn UpstreamHandler>> {
        let key = (
            resolution.category,
            resolution.provider.clone(),
            resolution.model_name.clone(),
        );
        if let Some(handler) = self.handlers.read().await.get(&key) {
            return Ok(Arc::clone(handler));
        }

        let handler = build_handler(resolution, parsed, &self.ctx)?;
        self.handlers
            .write()
            .await
            .insert(key, Arc::clone(&handler));
        Ok(handler)
    }

    /// Flush accounting on every cached handler.
    pub async fn shutdown(&self) {
        for handler in self.handlers.read().await.values() {
            handler.shutdown().await;
        }
    }
}
