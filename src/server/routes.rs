//! Proxy endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::anthropic::MessagesRequest;
use crate::app::AppState;
use crate::error::Result;
use crate::model::{parse, resolve_parsed};

pub type ProxyState = Arc<AppState>;

// ─── Health ───────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "claudish" }))
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// `POST /v1/messages` — the Anthropic Messages endpoint.
pub async fn messages(
    State(state): State<ProxyState>,
    Json(request): Json<MessagesRequest>,
) -> Response {
    match dispatch(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            log::warn!("[Proxy] request failed: {err}");
            err.into_response()
        }
    }
}

async fn dispatch(state: &AppState, request: MessagesRequest) -> Result<Response> {
    // Role keywords (opus/sonnet/haiku, subagent marker) pick the configured
    // model before any parsing happens.
    let spec = state.config().models.apply(&request.model).to_string();
    let parsed = parse(&spec);
    let resolution = resolve_parsed(&parsed, state.credentials());

    if let Some(warning) = &resolution.deprecation_warning {
        log::warn!("[Proxy] {warning}");
    }
    log::info!(
        "[Proxy] {} -> {} / {} ({:?})",
        request.model,
        resolution.provider_name,
        resolution.model_name,
        resolution.category,
    );

    let handler = state.handler_for(&resolution, &parsed).await?;
    handler.handle(request).await
}
