//! Shared gateway state.

use itak_channels::WebhookChannel;
use itak_config::PrincipalRegistry;
use itak_limits::RateLimiter;
use itak_runtime::AgentRuntime;
use std::sync::Arc;

/// Re-applies configuration on `POST /admin/reload-config`. The binary
/// wires this to the config loader, the limiter, and the registry.
pub trait AdminReload: Send + Sync {
    /// Reload everything hot-reloadable.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason on failure.
    fn reload(&self) -> Result<(), String>;
}

/// State threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    /// The runtime.
    pub runtime: Arc<AgentRuntime>,
    /// Principal registry (auth principal + webhook identity).
    pub registry: Arc<PrincipalRegistry>,
    /// Limiter, for lockout accounting and `/costs`.
    pub limiter: Arc<RateLimiter>,
    /// Webhook ingress channel.
    pub webhook: Arc<WebhookChannel>,
    /// SHA-256 of the bearer token, hex. `None` disables the API (every
    /// authenticated route returns 503).
    pub token_hash: Option<String>,
    /// Admin reload hook.
    pub reload: Arc<dyn AdminReload>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("has_token", &self.token_hash.is_some())
            .finish_non_exhaustive()
    }
}
