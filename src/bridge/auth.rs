//! Bridge authentication.
//!
//! A fresh 64-hex token is generated per bridge process and announced on
//! stdout for the host UI. Only its SHA-256 digest is kept in memory; the
//! middleware hashes each presented bearer token and compares digests.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::state::BridgeState;
use std::sync::Arc;

/// Generate a 64-hex bearer token.
pub fn generate_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Hex-encoded SHA-256 digest of a token, as stored and compared.
pub fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Middleware: validates `Authorization: Bearer <token>` against the stored
/// digest.
pub async fn auth_middleware(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token_hash(token) == state.token_hash => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
