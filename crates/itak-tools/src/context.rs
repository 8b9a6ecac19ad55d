//! Shared per-turn context for tool execution.

use itak_core::{Principal, SessionKey};
use itak_memory::MemoryFabric;
use itak_store::GraphStore;
use itak_vault::{OutputGuard, SecretVault};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::net::SsrfGuard;
use crate::spawner::SubAgentSpawner;

/// Everything a tool may touch during one call.
///
/// Built per turn by the scheduler. The spawner slot is per-context so
/// concurrent sessions never race on it.
pub struct ToolContext {
    /// Principal the call runs on behalf of.
    pub principal: Principal,
    /// Session the call belongs to.
    pub session_key: SessionKey,
    /// Monologue iteration that produced the call.
    pub iteration: u32,
    /// Root under which sandboxed tools may touch the filesystem.
    pub work_root: PathBuf,
    /// Per-session artifact directory (`data/sessions/<key>/media`).
    pub media_dir: PathBuf,
    /// Secret vault for just-in-time expansion.
    pub vault: Arc<SecretVault>,
    /// Output guard applied to every captured result.
    pub guard: OutputGuard,
    /// Memory fabric for the memory tools.
    pub memory: MemoryFabric,
    /// Direct graph access for the knowledge-graph tool.
    pub graph: Arc<dyn GraphStore>,
    /// SSRF guard for network tools.
    pub ssrf: SsrfGuard,
    /// Shared HTTP client for network tools.
    pub http: reqwest::Client,
    /// Inline output cap in bytes; larger output spills to an artifact.
    pub output_cap: usize,
    /// Sub-agent spawner, injected by the runtime before each turn.
    spawner: RwLock<Option<Arc<dyn SubAgentSpawner>>>,
}

impl ToolContext {
    /// Build a context. The scheduler fills in per-turn fields.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        principal: Principal,
        session_key: SessionKey,
        work_root: PathBuf,
        media_dir: PathBuf,
        vault: Arc<SecretVault>,
        guard: OutputGuard,
        memory: MemoryFabric,
        graph: Arc<dyn GraphStore>,
        ssrf: SsrfGuard,
    ) -> Self {
        // The client carries the guard's DNS filter; network tools must
        // not build their own.
        let http = ssrf.client();
        Self {
            principal,
            session_key,
            iteration: 0,
            work_root,
            media_dir,
            vault,
            guard,
            memory,
            graph,
            ssrf,
            http,
            output_cap: 30_000,
            spawner: RwLock::new(None),
        }
    }

    /// Set the iteration the next dispatch belongs to.
    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Inject (or clear) the sub-agent spawner for this turn.
    pub async fn set_spawner(&self, spawner: Option<Arc<dyn SubAgentSpawner>>) {
        *self.spawner.write().await = spawner;
    }

    /// The spawner, if the runtime injected one.
    pub async fn spawner(&self) -> Option<Arc<dyn SubAgentSpawner>> {
        self.spawner.read().await.clone()
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("principal", &self.principal.id)
            .field("session_key", &self.session_key)
            .field("iteration", &self.iteration)
            .field("work_root", &self.work_root)
            .finish_non_exhaustive()
    }
}
