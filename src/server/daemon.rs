//! Proxy server startup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::app::AppState;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::model::credentials::CredentialSource;

use super::routes::{health, messages};

/// Port tried first when the config does not pin one.
const DEFAULT_PORT: u16 = 8082;
const MAX_PORT_ATTEMPTS: u16 = 10;

/// Bind the proxy and serve until shutdown. Returns only on error or when
/// the listener closes.
pub async fn serve(config: ProxyConfig, credentials: Arc<dyn CredentialSource>) -> Result<()> {
    let listener = bind(config.port).await?;
    let addr = listener
        .local_addr()
        .map_err(|e| ProxyError::Internal(format!("listener address: {e}")))?;

    let state = AppState::new(Arc::new(config), credentials, addr.port())?;
    let app = router(state);

    log::info!("Claudish proxy listening on http://{addr}/v1/messages");
    axum::serve(listener, app)
        .await
        .map_err(|e| ProxyError::Internal(format!("server error: {e}")))
}

/// Build the proxy router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn bind(port: u16) -> Result<TcpListener> {
    if port != 0 {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        return TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Internal(format!("could not bind {addr}: {e}")));
    }
    // No pinned port: walk up from the default before giving up.
    for offset in 0..MAX_PORT_ATTEMPTS {
        let addr: SocketAddr = ([127, 0, 0, 1], DEFAULT_PORT + offset).into();
        if let Ok(listener) = TcpListener::bind(addr).await {
            return Ok(listener);
        }
    }
    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Internal(format!("could not bind any port: {e}")))
}
