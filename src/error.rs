//! Error types for the proxy core.
//!
//! Every failure that can reach a client is a [`ProxyError`] variant; the
//! wire shape is always `{"error":{"type":...,"message":...}}` with the
//! status code mapped per variant. Errors raised before the first SSE byte
//! render as a JSON response; mid-stream failures become a terminal SSE
//! `error` event instead (see `anthropic::sse`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Request to upstream timed out after {0} seconds")]
    Timeout(u64),

    #[error("Could not connect to upstream: {0}")]
    Connection(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Local model queue full ({queued}/{max}). GPU overloaded, try again later")]
    QueueFull { queued: usize, max: usize },

    #[error("Upstream rate limit exceeded: {0}")]
    RateLimited(String),

    #[error(
        "Unknown provider for model '{model}'. Use an explicit provider such as \
         'openrouter@{model}' or one of the supported shortcuts \
         (g@, oai@, or@, mm@, kimi@, kc@, glm@, zai@, oc@, zen@, v@, go@, poe@, \
         ollama@, lmstudio@, vllm@, mlx@)"
    )]
    UnknownProvider { model: String },

    #[error(
        "Missing credential for {provider}: set {env_var} ({description}). \
         Get a key at {url}{suggestion}"
    )]
    MissingCredential {
        provider: String,
        env_var: String,
        description: String,
        url: String,
        suggestion: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Wire-level error type string, as seen by Anthropic API clients.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Timeout(_) => "timeout_error",
            ProxyError::Connection(_) => "connection_error",
            ProxyError::Network(_) => "network_error",
            ProxyError::Api { .. } => "api_error",
            ProxyError::QueueFull { .. } => "api_error",
            ProxyError::RateLimited(_) => "rate_limited",
            ProxyError::UnknownProvider { .. } => "unknown_provider",
            ProxyError::MissingCredential { .. } => "missing_credential",
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::Internal(_) => "api_error",
        }
    }

    /// HTTP status for the JSON error envelope.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Connection(_) | ProxyError::Network(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Api { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UnknownProvider { .. } | ProxyError::MissingCredential { .. } => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a `reqwest` failure into the proxy's error kinds.
    pub fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout(timeout_secs)
        } else if err.is_connect() {
            ProxyError::Connection(err.to_string())
        } else {
            ProxyError::Network(err.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Result alias used across the proxy core.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_passes_status_through() {
        let err = ProxyError::Api {
            status: 418,
            message: "teapot".into(),
        };
        assert_eq!(err.status().as_u16(), 418);
        assert_eq!(err.error_type(), "api_error");
    }

    #[test]
    fn queue_full_mentions_gpu_overload() {
        let err = ProxyError::QueueFull {
            queued: 100,
            max: 100,
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        let msg = err.to_string();
        assert!(msg.contains("GPU overloaded"));
        assert!(msg.contains("100/100"));
    }

    #[test]
    fn unknown_provider_message_is_actionable() {
        let err = ProxyError::UnknownProvider {
            model: "acme/super-1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("openrouter@acme/super-1"));
        assert!(msg.contains("g@"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_credential_names_the_env_var() {
        let err = ProxyError::MissingCredential {
            provider: "Google Gemini".into(),
            env_var: "GEMINI_API_KEY".into(),
            description: "Google AI Studio API key".into(),
            url: "https://aistudio.google.com/apikey".into(),
            suggestion: ", or set OPENROUTER_API_KEY to route via OpenRouter".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("GEMINI_API_KEY"));
        assert!(msg.contains("https://aistudio.google.com/apikey"));
        assert!(msg.contains("OPENROUTER_API_KEY"));
    }
}
