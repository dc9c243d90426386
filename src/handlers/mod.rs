//! Upstream handlers.
//!
//! One handler per upstream API shape. Each receives the parsed Anthropic
//! request, translates it, performs the outbound call (through the local or
//! Gemini queue where required), consumes the upstream stream, and drives the
//! Anthropic SSE emitter. Handlers own their session accounting and are
//! cached by the server per `(category, provider, model)`.

pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod responses;
pub mod schema;
pub mod translate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

use crate::anthropic::MessagesRequest;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::model::credentials::{provider_info, CredentialSource};
use crate::model::resolver::{Category, Resolution};
use crate::model::ParsedModel;
use crate::pricing::PricingRegistry;
use crate::queue::{GeminiQueue, LocalQueue};

/// Outbound connect/read-headers timeout.
pub const UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Frames buffered towards the client before backpressure kicks in.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// A translated upstream, ready to serve Messages requests.
#[async_trait]
pub trait UpstreamHandler: Send + Sync {
    /// Serve one request, returning the SSE response.
    async fn handle(&self, request: MessagesRequest) -> Result<Response>;

    /// Flush accounting and drop any per-session state.
    async fn shutdown(&self) {}
}

/// Shared services a handler needs, owned by the application state.
#[derive(Clone)]
pub struct HandlerContext {
    pub client: reqwest::Client,
    pub local_queue: Arc<LocalQueue<reqwest::Response>>,
    pub gemini_queue: Arc<GeminiQueue<reqwest::Response>>,
    pub pricing: Arc<PricingRegistry>,
    pub credentials: Arc<dyn CredentialSource>,
    pub config: Arc<ProxyConfig>,
    pub usage_dir: PathBuf,
    pub port: u16,
}

impl HandlerContext {
    /// Fetch the credential value for a provider, trying aliases.
    pub fn credential_value(&self, canonical: &str) -> Option<String> {
        let info = provider_info(canonical)?;
        if info.env_var.is_empty() {
            return None;
        }
        self.credentials.get(info.env_var).or_else(|| {
            info.aliases
                .iter()
                .find_map(|alias| self.credentials.get(alias))
        })
    }
}

/// Build the shared outbound HTTP client.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))
}

/// Send a request builder and normalize failures: connect/timeout errors map
/// to the typed kinds, non-2xx responses are drained into an `Api` error so
/// queues can inspect the body.
pub async fn send_upstream(builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = builder
        .send()
        .await
        .map_err(|e| ProxyError::from_reqwest(e, UPSTREAM_TIMEOUT_SECS))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProxyError::Api {
        status: status.as_u16(),
        message: if body.is_empty() {
            status.to_string()
        } else {
            body
        },
    })
}

/// Open the client-facing SSE channel: the receiver becomes the response
/// body, the sender feeds the emitter.
pub fn sse_channel() -> (mpsc::Sender<Bytes>, Response) {
    let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_CHANNEL_CAPACITY);
    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    let body = Body::from_stream(stream);
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_default();
    (tx, response)
}

/// Instantiate the handler for a resolution.
///
/// Selection: Gemini-native for Google/Vertex/Code Assist, the Responses API
/// for OpenAI `codex` models, Ollama-native for OllamaCloud, and the Chat
/// Completions shape for everything else (including local servers).
pub fn build_handler(
    resolution: &Resolution,
    parsed: &ParsedModel,
    ctx: &HandlerContext,
) -> Result<Arc<dyn UpstreamHandler>> {
    match resolution.category {
        Category::Unknown => Err(ProxyError::UnknownProvider {
            model: parsed.original.clone(),
        }),
        Category::NativeAnthropic => Err(ProxyError::InvalidRequest(
            "native Anthropic models are served by the embedding runtime, not the proxy".into(),
        )),
        Category::Local => Ok(Arc::new(openai::ChatCompletionsHandler::local(
            resolution, parsed, ctx,
        ))),
        Category::OpenRouter => {
            require_credential(resolution)?;
            Ok(Arc::new(openai::ChatCompletionsHandler::remote(
                resolution, ctx,
            )))
        }
        Category::DirectApi => {
            require_credential(resolution)?;
            match resolution.provider.as_str() {
                "google" | "vertex" | "gemini-codeassist" => {
                    Ok(Arc::new(gemini::GeminiHandler::new(resolution, ctx)))
                }
                "ollamacloud" => Ok(Arc::new(ollama::OllamaHandler::new(resolution, ctx))),
                "openai" if resolution.model_name.contains("codex") => {
                    Ok(Arc::new(responses::ResponsesHandler::new(resolution, ctx)))
                }
                _ => Ok(Arc::new(openai::ChatCompletionsHandler::remote(
                    resolution, ctx,
                ))),
            }
        }
    }
}

fn require_credential(resolution: &Resolution) -> Result<()> {
    if resolution.credential_available {
        return Ok(());
    }
    let suggestion = if resolution.provider != "openrouter" {
        ", or set OPENROUTER_API_KEY to route via OpenRouter".to_string()
    } else {
        String::new()
    };
    Err(ProxyError::MissingCredential {
        provider: resolution.provider_name.clone(),
        env_var: resolution
            .required_credential_env_var
            .clone()
            .unwrap_or_default(),
        description: resolution.credential_description.clone(),
        url: resolution.credential_url.clone(),
        suggestion,
    })
}

/// Mint a fresh Anthropic-style tool id.
pub fn new_tool_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}
