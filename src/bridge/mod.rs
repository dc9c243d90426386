//! Bridge server: a token-authenticated control plane a host UI drives.
//!
//! On startup the bridge prints two discovery lines to stdout:
//!
//! ```text
//! CLAUDISH_BRIDGE_PORT=<port>
//! CLAUDISH_BRIDGE_TOKEN=<64-hex>
//! ```
//!
//! Everything except `GET /health` and `GET /proxy.pac` requires
//! `Authorization: Bearer <token>`.

pub mod auth;
pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::error::{ProxyError, Result};

use auth::{auth_middleware, generate_token, token_hash};
use routes::{
    get_config, health, logs, proxy_disable, proxy_enable, proxy_pac, set_config, status,
};
use state::BridgeState;

const DEFAULT_PORT: u16 = 18900;
const MAX_PORT_ATTEMPTS: u16 = 10;

/// Start the bridge, announce the port and token on stdout, and serve until
/// shutdown.
pub async fn serve() -> Result<()> {
    let token = generate_token();
    let state = Arc::new(BridgeState::new(token_hash(&token)));

    let listener = bind().await?;
    let addr = listener
        .local_addr()
        .map_err(|e| ProxyError::Internal(format!("listener address: {e}")))?;

    // Discovery lines for the host UI. These must be the only stdout output.
    println!("CLAUDISH_BRIDGE_PORT={}", addr.port());
    println!("CLAUDISH_BRIDGE_TOKEN={token}");

    state.push_log("info", format!("bridge listening on {addr}"));
    log::info!("Claudish bridge listening on {addr}");

    let app = router(state);
    axum::serve(listener, app)
        .await
        .map_err(|e| ProxyError::Internal(format!("bridge error: {e}")))
}

/// Build the bridge router with the public/protected split.
pub fn router(state: Arc<BridgeState>) -> Router {
    let protected = Router::new()
        .route("/status", get(status))
        .route("/config", get(get_config).post(set_config))
        .route("/proxy/enable", post(proxy_enable))
        .route("/proxy/disable", post(proxy_disable))
        .route("/logs", get(logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    let public = Router::new()
        .route("/health", get(health))
        .route("/proxy.pac", get(proxy_pac));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(CorsLayer::permissive())
}

async fn bind() -> Result<TcpListener> {
    for offset in 0..MAX_PORT_ATTEMPTS {
        let addr: SocketAddr = ([127, 0, 0, 1], DEFAULT_PORT + offset).into();
        if let Ok(listener) = TcpListener::bind(addr).await {
            return Ok(listener);
        }
    }
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .map_err(|e| ProxyError::Internal(format!("could not bind bridge port: {e}")))
}
