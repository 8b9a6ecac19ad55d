//! Service construction: stores, router, fabric, runtime, gateway state.

use anyhow::Context;
use itak_channels::{AdapterFabric, MediaPipeline, WebhookChannel, WebhookNotifier, WebhookOutboundEvent};
use itak_checkpoint::CheckpointStore;
use itak_config::{ItakConfig, PrincipalRegistry};
use itak_gateway::{AdminReload, AppState};
use itak_heal::HealingEngine;
use itak_hooks::HookRunnerBuilder;
use itak_limits::RateLimiter;
use itak_llm::{ModelRouter, ScriptedProvider};
use itak_memory::{CoreContext, MemoryFabric};
use itak_runtime::{AgentRuntime, RuntimeServices, SubAgentProfile};
use itak_store::{
    Database, GraphStore, SurrealGraphStore, SurrealRelationalStore, SurrealTaskStore,
    SurrealVectorStore,
};
use itak_tools::{
    BrowserTool, CodeExecTool, DelegateTool, KnowledgeGraphTool, MemoryForgetTool,
    MemoryLoadTool, MemorySaveTool, NetworkPolicy, ResponseTool, SsrfGuard, ToolExecutor,
    ToolRegistry, WebSearchTool,
};
use itak_vault::{OutputGuard, SecretVault};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the entrypoint needs after bootstrap.
pub(crate) struct App {
    pub(crate) runtime: Arc<AgentRuntime>,
    pub(crate) registry: Arc<PrincipalRegistry>,
    pub(crate) state: AppState,
    /// Kept alive for the outbound progress router.
    pub(crate) _fabric: Arc<AdapterFabric>,
}

struct Reloader {
    config_path: PathBuf,
    registry: Arc<PrincipalRegistry>,
    limiter: Arc<RateLimiter>,
}

impl AdminReload for Reloader {
    fn reload(&self) -> Result<(), String> {
        self.registry.reload().map_err(|e| e.to_string())?;
        let config = itak_config::load_or_init(&self.config_path).map_err(|e| e.to_string())?;
        self.limiter.reload(config.limits);
        info!("Configuration reloaded");
        Ok(())
    }
}

/// Build the whole service graph.
pub(crate) async fn bootstrap(
    data_dir: &Path,
    config: &ItakConfig,
    owner_name: &str,
) -> anyhow::Result<App> {
    std::fs::create_dir_all(data_dir.join("sessions"))?;
    std::fs::create_dir_all(data_dir.join("memory/core"))?;
    std::fs::create_dir_all(data_dir.join("usage"))?;

    // Vault first: the log redactor needs it.
    let vault = Arc::new(SecretVault::new());
    vault
        .load_dir(&data_dir.join("secrets"))
        .context("loading secrets")?;
    let mut guard = OutputGuard::new(Arc::clone(&vault));
    if config.security.strict_output_guard {
        guard = guard.strict();
    }
    crate::logging::set_guard(guard.clone());

    // Principals.
    let registry = Arc::new(
        PrincipalRegistry::load_or_init(data_dir.join("principals.json"), owner_name)
            .context("loading principal registry")?,
    );
    let owner = registry
        .owner()
        .context("principal registry has no owner")?;

    // Limiter, with persisted usage restored.
    let limiter = Arc::new(RateLimiter::new(config.limits.clone()));
    let usage_path = data_dir.join("usage/usage.json");
    if let Ok(body) = std::fs::read_to_string(&usage_path)
        && let Ok(snapshot) = serde_json::from_str(&body)
    {
        limiter.restore(&snapshot);
    }
    spawn_usage_persister(Arc::clone(&limiter), usage_path);

    // Stores: one embedded SurrealDB behind all three tiers plus tasks.
    let db_path = data_dir.join("memory/recall");
    let db = Database::connect_embedded(&db_path.to_string_lossy())
        .await
        .context("opening the memory database")?;
    let relational = Arc::new(SurrealRelationalStore::new(db.clone()));
    let graph: Arc<dyn GraphStore> = Arc::new(SurrealGraphStore::new(db.clone()));
    let vector = Arc::new(SurrealVectorStore::new(db.clone()));
    let tasks = Arc::new(SurrealTaskStore::new(db));

    // Router. The `local` provider is a deterministic dry-run stand-in;
    // real provider bindings register their own implementations here.
    let mut router_builder = ModelRouter::builder()
        .provider(Arc::new(ScriptedProvider::new("local", Vec::new())));
    for (role, bindings) in &config.models {
        router_builder = router_builder.role(*role, bindings.clone());
    }
    let router = router_builder.build(Arc::clone(&limiter));

    // Memory fabric with the filesystem core tier.
    let fabric = MemoryFabric::new(
        relational,
        Arc::clone(&graph),
        vector,
        router.clone(),
        config.memory.clone(),
        Some(CoreContext::new(data_dir.join("memory/core"))),
    );

    // Hooks: explicit registration at init; extensions slot in here.
    let hooks = Arc::new(HookRunnerBuilder::new().build());

    // Tools.
    let ssrf = SsrfGuard::new(
        NetworkPolicy::open()
            .with_allowlist(config.security.network_allowlist.clone())
            .with_local_exemptions(config.security.local_exemptions.clone()),
    );
    let mut registry_builder = ToolRegistry::new()
        .register(Arc::new(ResponseTool))
        .register(Arc::new(MemorySaveTool))
        .register(Arc::new(MemoryLoadTool))
        .register(Arc::new(MemoryForgetTool))
        .register(Arc::new(DelegateTool))
        .register(Arc::new(CodeExecTool))
        .register(Arc::new(BrowserTool))
        .register(Arc::new(KnowledgeGraphTool));
    if let Some(endpoint) = &config.search_endpoint {
        registry_builder = registry_builder.register(Arc::new(WebSearchTool::new(endpoint)));
    } else {
        warn!("No search endpoint configured; web_search disabled");
    }
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(registry_builder),
        Arc::clone(&hooks),
        Arc::clone(&limiter),
    ));

    let healer = Arc::new(HealingEngine::new(
        fabric.clone(),
        router.clone(),
        config.heal.clone(),
    ));

    let services = RuntimeServices {
        fabric: fabric.clone(),
        router: router.clone(),
        executor,
        healer,
        checkpoints: Arc::new(CheckpointStore::new(
            data_dir.join("sessions"),
            std::time::Duration::from_millis(config.scheduler.checkpoint_interval_ms),
        )),
        hooks,
        sessions: Arc::new(itak_runtime::SessionStore::new(data_dir.join("sessions"))),
        vault: Arc::clone(&vault),
        guard,
        graph,
        tasks,
        ssrf: ssrf.clone(),
        work_root: data_dir.join("work"),
    };

    let runtime = AgentRuntime::new_arc(
        services,
        config.scheduler.clone(),
        vec![SubAgentProfile::researcher()],
    );

    // Channel fabric. Concrete messaging adapters register here when
    // their channel is enabled in config; the webhook channel is always
    // available through the gateway.
    let resolver_registry = Arc::clone(&registry);
    let fabric_resolver = move |channel: &str, external: &str| {
        resolver_registry.resolve(channel, external)
    };
    let adapter_fabric = Arc::new(AdapterFabric::new(
        Arc::clone(&runtime),
        Arc::new(fabric_resolver),
        MediaPipeline::new(router, data_dir.join("sessions"), ssrf.clone()),
    ));
    adapter_fabric
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("adapter fabric start failed: {e}"))?;

    let webhook = Arc::new(WebhookChannel::new(
        Arc::clone(&runtime),
        Arc::clone(&vault),
        owner,
        ssrf.clone(),
    ));

    if !config.webhook_outbound.is_empty() {
        spawn_outbound_notifier(
            Arc::clone(&runtime),
            Arc::clone(&limiter),
            WebhookNotifier::new(
                config.webhook_outbound.clone(),
                Arc::clone(&vault),
                "webhook_outbound",
                ssrf,
            ),
        );
    }

    let state = AppState {
        runtime: Arc::clone(&runtime),
        registry: Arc::clone(&registry),
        limiter: Arc::clone(&limiter),
        webhook,
        token_hash: config.api_token_sha256.clone(),
        reload: Arc::new(Reloader {
            config_path: data_dir.join("config.json"),
            registry: Arc::clone(&registry),
            limiter,
        }),
    };

    Ok(App {
        runtime,
        registry,
        state,
        _fabric: adapter_fabric,
    })
}

/// Emit the enumerated outbound events: completed tasks, critical
/// errors, and a daily usage report.
fn spawn_outbound_notifier(
    runtime: Arc<AgentRuntime>,
    limiter: Arc<RateLimiter>,
    notifier: WebhookNotifier,
) {
    tokio::spawn(async move {
        let mut events = runtime.subscribe();
        let mut daily = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
        daily.tick().await; // the first tick fires immediately; skip it
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(itak_runtime::ProgressEvent::Final { session, .. }) => {
                        notifier
                            .emit(
                                WebhookOutboundEvent::TaskCompleted,
                                serde_json::json!({ "session": session }),
                            )
                            .await;
                    },
                    Ok(itak_runtime::ProgressEvent::Error { session, report }) => {
                        notifier
                            .emit(
                                WebhookOutboundEvent::ErrorCritical,
                                serde_json::json!({ "session": session, "report": report }),
                            )
                            .await;
                    },
                    Ok(_) => {},
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {},
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = daily.tick() => {
                    notifier
                        .emit(
                            WebhookOutboundEvent::DailyReport,
                            serde_json::json!({ "usage": limiter.snapshot() }),
                        )
                        .await;
                },
            }
        }
    });
}

/// Persist the budget counters once a minute so restarts keep window
/// state.
fn spawn_usage_persister(limiter: Arc<RateLimiter>, path: PathBuf) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let snapshot = limiter.snapshot();
            match serde_json::to_vec_pretty(&snapshot) {
                Ok(body) => {
                    if let Err(e) = tokio::fs::write(&path, body).await {
                        warn!(error = %e, "Usage snapshot write failed");
                    }
                },
                Err(e) => warn!(error = %e, "Usage snapshot encode failed"),
            }
        }
    });
}
