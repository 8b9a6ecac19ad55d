//! Bearer-token authentication with lockout accounting.

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::state::AppState;

/// Middleware: every API route requires `Authorization: Bearer <token>`.
/// The stored hash is compared in constant time; failures count toward
/// the peer's lockout window.
pub(crate) async fn require_bearer(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected_hash) = state.token_hash.as_deref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "API token not configured",
        )
            .into_response();
    };

    let lockout_key = format!("http:{}", peer.ip());
    if let Some(until) = state
        .limiter
        .lockout_until(&lockout_key, chrono::Utc::now())
    {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            format!("locked out until {until}"),
        )
            .into_response();
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = presented.is_some_and(|token| {
        let hash = hex::encode(Sha256::digest(token.as_bytes()));
        hash.as_bytes().ct_eq(expected_hash.as_bytes()).into()
    });

    if !authorized {
        warn!(peer = %peer.ip(), "Bearer auth failed");
        state.limiter.record_auth_failure(&lockout_key);
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }
    next.run(request).await
}
