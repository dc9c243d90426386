//! Bridge control-plane endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::config::ProxyConfig;

use super::state::{BridgeState, DEFAULT_LOG_LIMIT};

// ─── Public endpoints ─────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "claudish-bridge" }))
}

/// Proxy auto-config script pointing browsers/clients at the local proxy.
pub async fn proxy_pac() -> impl IntoResponse {
    let pac = "function FindProxyForURL(url, host) {\n  \
               if (dnsDomainIs(host, \"anthropic.com\")) {\n    \
               return \"PROXY 127.0.0.1:8082\";\n  }\n  \
               return \"DIRECT\";\n}\n";
    (
        [(header::CONTENT_TYPE, "application/x-ns-proxy-autoconfig")],
        pac,
    )
}

// ─── Authenticated endpoints ──────────────────────────────────────────────────

pub async fn status(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    let (enabled, credential_count) = state
        .control
        .lock()
        .map(|c| (c.proxy_enabled, c.credentials.len()))
        .unwrap_or((false, 0));
    Json(json!({
        "proxy_enabled": enabled,
        "credentials": credential_count,
        "started_at": state.started_at,
    }))
}

pub async fn get_config(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    let config = state
        .control
        .lock()
        .map(|c| c.config.clone())
        .unwrap_or_default();
    Json(config)
}

pub async fn set_config(
    State(state): State<Arc<BridgeState>>,
    Json(config): Json<ProxyConfig>,
) -> impl IntoResponse {
    if let Ok(mut control) = state.control.lock() {
        control.config = config;
    }
    state.push_log("info", "configuration updated");
    Json(json!({ "ok": true }))
}

#[derive(Debug, Default, Deserialize)]
pub struct EnableRequest {
    /// Env-var name → value pairs resolved ahead of the process environment.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

pub async fn proxy_enable(
    State(state): State<Arc<BridgeState>>,
    Json(request): Json<EnableRequest>,
) -> impl IntoResponse {
    let count = request.credentials.len();
    if let Ok(mut control) = state.control.lock() {
        control.credentials = request.credentials;
        control.proxy_enabled = true;
    }
    state.push_log("info", format!("proxy enabled ({count} credentials)"));
    Json(json!({ "ok": true }))
}

pub async fn proxy_disable(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    if let Ok(mut control) = state.control.lock() {
        control.proxy_enabled = false;
        control.credentials.clear();
    }
    state.push_log("info", "proxy disabled");
    Json(json!({ "ok": true }))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

pub async fn logs(State(state): State<Arc<BridgeState>>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Json(json!({ "logs": state.recent_logs(limit) }))
}
