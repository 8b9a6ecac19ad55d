//! HTTP gateway: the dashboard API and webhook ingress.
//!
//! Every route except `/health` and the signed webhook requires a bearer
//! token. The token is stored hashed and compared in constant time;
//! failed attempts feed the limiter's lockout counter.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod auth;
mod handlers;
mod state;

pub use state::{AdminReload, AppState};

use axum::Router;
use axum::routing::{delete, get, patch, post};
use std::net::SocketAddr;
use tracing::info;

/// Build the gateway router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/chat", post(handlers::chat))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{key}/transcript", get(handlers::transcript))
        .route("/sessions/{key}", delete(handlers::archive_session))
        .route("/sessions/{key}/cancel", post(handlers::cancel_session))
        .route("/memory/search", get(handlers::memory_search))
        .route("/memory", post(handlers::memory_save))
        .route("/memory/{id}", delete(handlers::memory_forget))
        .route("/tasks", get(handlers::list_tasks).post(handlers::create_task))
        .route("/tasks/{id}", patch(handlers::patch_task))
        .route("/costs", get(handlers::costs))
        .route("/admin/reload-config", post(handlers::reload_config))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhook/inbound/{route}", post(handlers::webhook_inbound))
        .merge(api)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway until `shutdown` resolves.
///
/// # Errors
///
/// Returns an I/O error when the listener cannot bind.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Gateway listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
