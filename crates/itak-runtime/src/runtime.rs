//! The runtime container: service handles, per-session queues, the
//! global concurrency cap, and cancellation scopes.

use dashmap::DashMap;
use itak_checkpoint::CheckpointStore;
use itak_core::{Principal, SessionKey};
use itak_heal::HealingEngine;
use itak_hooks::{HookContext, HookRunner, LifecyclePoint};
use itak_llm::ModelRouter;
use itak_memory::MemoryFabric;
use itak_store::{GraphStore, TaskStore};
use itak_tools::{SsrfGuard, ToolExecutor};
use itak_vault::{OutputGuard, SecretVault};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::progress::ProgressEvent;
use crate::session::SessionStore;
use crate::subagent::{SubAgentCoordinator, SubAgentProfile};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Iteration budget per monologue.
    pub max_iterations: u32,
    /// Consecutive parse failures before forced termination.
    pub max_consecutive_parse_failures: u32,
    /// Transcript turns included in the prompt.
    pub history_tail: usize,
    /// Memory entries fetched per prompt assembly.
    pub memory_k: usize,
    /// Simultaneous monologues across all sessions.
    pub global_concurrency: usize,
    /// Inbound queue depth per session.
    pub queue_depth: usize,
    /// Turns compressed per soft-pressure pass.
    pub compress_block: usize,
    /// Minimum interval between debounced checkpoints, milliseconds.
    pub checkpoint_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            max_consecutive_parse_failures: 3,
            history_tail: 40,
            memory_k: 5,
            global_concurrency: 8,
            queue_depth: 16,
            compress_block: 8,
            checkpoint_interval_ms: 500,
        }
    }
}

/// Service handles threaded through the runtime. Everything is an
/// explicit handle; tests inject stubs freely.
pub struct RuntimeServices {
    /// Memory fabric.
    pub fabric: MemoryFabric,
    /// Model router.
    pub router: ModelRouter,
    /// Tool executor.
    pub executor: Arc<ToolExecutor>,
    /// Self-healing engine.
    pub healer: Arc<HealingEngine>,
    /// Checkpoint store.
    pub checkpoints: Arc<CheckpointStore>,
    /// Hook runner.
    pub hooks: Arc<HookRunner>,
    /// Session store.
    pub sessions: Arc<SessionStore>,
    /// Secret vault.
    pub vault: Arc<SecretVault>,
    /// Output guard.
    pub guard: OutputGuard,
    /// Graph store handle for the knowledge-graph tool.
    pub graph: Arc<dyn GraphStore>,
    /// Task store for task lifecycle tracking.
    pub tasks: Arc<dyn TaskStore>,
    /// SSRF guard for network tools.
    pub ssrf: SsrfGuard,
    /// Root for sandbox scratch directories.
    pub work_root: PathBuf,
}

/// One inbound user message, as handed over by an adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Target session.
    pub session_key: SessionKey,
    /// Resolved principal.
    pub principal: Principal,
    /// Message text (media already described by the adapter fabric).
    pub content: String,
}

/// The agent runtime.
pub struct AgentRuntime {
    pub(crate) services: RuntimeServices,
    pub(crate) config: RuntimeConfig,
    pub(crate) progress: broadcast::Sender<ProgressEvent>,
    pub(crate) coordinator: Arc<SubAgentCoordinator>,
    queues: DashMap<SessionKey, mpsc::Sender<InboundMessage>>,
    global_permits: Arc<Semaphore>,
    cancellations: DashMap<SessionKey, CancellationToken>,
    self_ref: Weak<Self>,
}

impl AgentRuntime {
    /// Build the runtime wrapped in `Arc`, with the self-reference the
    /// session workers and the sub-agent coordinator need pre-set.
    #[must_use]
    pub fn new_arc(
        services: RuntimeServices,
        config: RuntimeConfig,
        profiles: Vec<SubAgentProfile>,
    ) -> Arc<Self> {
        let (progress, _) = broadcast::channel(256);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let coordinator = Arc::new(SubAgentCoordinator::new(weak.clone(), profiles));
            Self {
                global_permits: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
                services,
                config,
                progress,
                coordinator,
                queues: DashMap::new(),
                cancellations: DashMap::new(),
                self_ref: weak.clone(),
            }
        })
    }

    /// Subscribe to the progress bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Service handles (for the gateway's observability surface).
    #[must_use]
    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub(crate) fn publish(&self, event: ProgressEvent) {
        // A lagging or absent subscriber must never stall the scheduler.
        let _ = self.progress.send(event);
    }

    /// Enqueue a message on its session's FIFO. Messages for one session
    /// process serially; sessions run in parallel under the global cap.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::QueueFull`] when the session queue is at
    /// depth; the adapter should reply with a busy notice.
    pub fn enqueue_message(&self, message: InboundMessage) -> RuntimeResult<()> {
        let key = message.session_key.clone();
        let sender = self
            .queues
            .entry(key.clone())
            .or_insert_with(|| self.spawn_session_worker(&key))
            .clone();
        sender.try_send(message).map_err(|_| RuntimeError::QueueFull { session: key })
    }

    /// Enqueue a message and wait for the session's final response to it.
    ///
    /// # Errors
    ///
    /// Propagates queue overflow; times out with [`RuntimeError::Cancelled`]
    /// when no final event arrives within `timeout`.
    pub async fn submit_and_wait(
        &self,
        message: InboundMessage,
        timeout: std::time::Duration,
    ) -> RuntimeResult<String> {
        let key = message.session_key.clone();
        let mut events = self.subscribe();
        self.enqueue_message(message)?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ProgressEvent::Final { session, text }) if session == key => {
                        return Ok(text);
                    },
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Progress subscriber lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(RuntimeError::Cancelled);
                    },
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RuntimeError::Cancelled)?
    }

    /// Cancel the in-flight monologue (if any) on a session. The signal
    /// cascades into tool subprocesses and sub-agents.
    pub fn cancel(&self, key: &SessionKey) {
        if let Some(token) = self.cancellations.get(key) {
            info!(session = %key, "Cancellation requested");
            token.cancel();
        }
    }

    pub(crate) fn cancellation_scope(&self, key: &SessionKey) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancellations.insert(key.clone(), token.clone());
        token
    }

    pub(crate) fn clear_cancellation(&self, key: &SessionKey) {
        self.cancellations.remove(key);
    }

    fn spawn_session_worker(&self, key: &SessionKey) -> mpsc::Sender<InboundMessage> {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(self.config.queue_depth.max(1));
        let weak = self.self_ref.clone();
        let permits = Arc::clone(&self.global_permits);
        let key = key.clone();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(runtime) = weak.upgrade() else { break };
                let Ok(_permit) = permits.acquire().await else { break };
                runtime.process_message(message).await;
            }
            info!(session = %key, "Session worker stopped");
        });
        tx
    }

    async fn process_message(self: &Arc<Self>, message: InboundMessage) {
        let session = self
            .services
            .sessions
            .load_or_create(&message.session_key, &message.principal)
            .await;
        let cancel = self.cancellation_scope(&message.session_key);

        self.run_monologue(&session, &message.content, &cancel).await;

        self.clear_cancellation(&message.session_key);
    }

    /// Restart path: for every checkpointed session with progress, inject
    /// a resume notice so the next message continues the task. The
    /// resolver maps a session back to its principal (via the registry's
    /// channel bindings).
    pub async fn resume_all<R>(&self, resolver: R)
    where
        R: Fn(&SessionKey) -> Option<Principal>,
    {
        let Ok(keys) = self.services.checkpoints.known_sessions().await else {
            return;
        };
        for key in keys {
            let Ok(Some(record)) = self.services.checkpoints.resume(&key).await else {
                continue;
            };
            if record.iteration == 0
                || record.working_context.terminal
                || record.working_context.cancelled
            {
                continue;
            }
            let Some(principal) = resolver(&key) else {
                warn!(session = %key, "No principal resolves for checkpointed session");
                continue;
            };
            let session = self.services.sessions.load_or_create(&key, &principal).await;
            let mut guard = session.lock().await;
            let notice = itak_core::Turn::system(format!(
                "Restarted mid-task at step {} (iteration {}); resuming.",
                record.working_context.current_step.saturating_add(1),
                record.iteration
            ));
            let _ = self.services.sessions.persist_turn(&key, &notice).await;
            guard.append(notice);
            guard.working = Some(record.working_context);
            info!(session = %key, iteration = record.iteration, "Session marked for resume");
        }
    }

    /// Fire the `agent_init` lifecycle point.
    pub async fn fire_init(&self) {
        let _ = self
            .services
            .hooks
            .dispatch(HookContext::new(LifecyclePoint::AgentInit))
            .await;
    }

    /// Fire the `agent_shutdown` lifecycle point and flush derivations.
    pub async fn shutdown(&self) {
        let _ = self
            .services
            .hooks
            .dispatch(HookContext::new(LifecyclePoint::AgentShutdown))
            .await;
        self.services
            .fabric
            .flush_derivations(std::time::Duration::from_secs(5))
            .await;
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("config", &self.config)
            .field("active_sessions", &self.queues.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory harness shared by the scheduler tests.

    use super::*;
    use itak_heal::HealConfig;
    use itak_limits::{LimiterConfig, RateLimiter};
    use itak_llm::{ModelBinding, ModelRole, ScriptedAction, ScriptedProvider};
    use itak_memory::{MemoryConfig, MemoryFabric};
    use itak_store::{MemGraphStore, MemRelationalStore, MemTaskStore, MemVectorStore};
    use itak_tools::{
        MemoryForgetTool, MemoryLoadTool, MemorySaveTool, NetworkPolicy, ResponseTool,
        ToolRegistry,
    };

    pub(crate) struct Harness {
        pub(crate) runtime: Arc<AgentRuntime>,
        pub(crate) fabric: MemoryFabric,
        pub(crate) _dir: tempfile::TempDir,
    }

    pub(crate) fn harness(script: Vec<ScriptedAction>) -> Harness {
        harness_with_profiles(script, vec![crate::SubAgentProfile::researcher()])
    }

    pub(crate) fn harness_with_profiles(
        script: Vec<ScriptedAction>,
        profiles: Vec<crate::SubAgentProfile>,
    ) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let limiter = Arc::new(RateLimiter::new(LimiterConfig::default()));

        let provider = Arc::new(ScriptedProvider::new("scripted", script));
        let router = ModelRouter::builder()
            .provider(provider)
            .role(
                ModelRole::Chat,
                vec![ModelBinding::new("scripted", "chat").free_model()],
            )
            .role(
                ModelRole::Utility,
                vec![ModelBinding::new("scripted", "utility").free_model()],
            )
            .role(
                ModelRole::Embedding,
                vec![ModelBinding::new("scripted", "embedder").free_model()],
            )
            .build(Arc::clone(&limiter));

        let graph: Arc<dyn GraphStore> = Arc::new(MemGraphStore::new());
        let fabric = MemoryFabric::new(
            Arc::new(MemRelationalStore::new()),
            Arc::clone(&graph),
            Arc::new(MemVectorStore::new()),
            router.clone(),
            MemoryConfig {
                model_extraction: false,
                ..MemoryConfig::default()
            },
            None,
        );

        let registry = ToolRegistry::new()
            .register(Arc::new(ResponseTool))
            .register(Arc::new(MemorySaveTool))
            .register(Arc::new(MemoryLoadTool))
            .register(Arc::new(MemoryForgetTool))
            .register(Arc::new(itak_tools::DelegateTool));
        let hooks = Arc::new(HookRunner::empty());
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            Arc::clone(&hooks),
            Arc::clone(&limiter),
        ));

        let healer = Arc::new(HealingEngine::new(
            fabric.clone(),
            router.clone(),
            HealConfig::default(),
        ));

        let services = RuntimeServices {
            fabric: fabric.clone(),
            router,
            executor,
            healer,
            checkpoints: Arc::new(CheckpointStore::new(
                dir.path().join("sessions"),
                std::time::Duration::ZERO,
            )),
            hooks,
            sessions: Arc::new(SessionStore::new(dir.path().join("sessions"))),
            vault: Arc::new(SecretVault::new()),
            guard: OutputGuard::new(Arc::new(SecretVault::new())),
            graph,
            tasks: Arc::new(MemTaskStore::new()),
            ssrf: SsrfGuard::new(NetworkPolicy::open()),
            work_root: dir.path().join("work"),
        };

        let runtime = AgentRuntime::new_arc(services, RuntimeConfig::default(), profiles);
        Harness {
            runtime,
            fabric,
            _dir: dir,
        }
    }

    pub(crate) fn tool_json(name: &str, args: serde_json::Value) -> String {
        serde_json::json!({"tool": name, "args": args}).to_string()
    }

    pub(crate) fn response_json(text: &str) -> String {
        tool_json("response", serde_json::json!({"text": text}))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{harness, harness_with_profiles, response_json, tool_json};
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::subagent::SubAgentProfile;
    use itak_core::{Role, RoomType, Turn, TurnRole};
    use itak_llm::{ModelRole, ScriptedAction};
    use itak_tools::SubAgentSpawner;
    use std::time::Duration;

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            session_key: SessionKey::new("cli", RoomType::Direct, "unit"),
            principal: Principal::new("tester", Role::Owner).with_binding("cli", "unit"),
            content: content.to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn monologue_runs_tool_then_responds() {
        let h = harness(vec![
            ScriptedAction::Complete(tool_json(
                "memory_save",
                serde_json::json!({"content": "the VPS port is 48920"}),
            )),
            ScriptedAction::Complete(response_json("Saved. The port is 48920.")),
        ]);

        let reply = h
            .runtime
            .submit_and_wait(inbound("Remember: the VPS port is 48920"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reply, "Saved. The port is 48920.");

        h.fabric.flush_derivations(Duration::from_secs(2)).await;

        let key = SessionKey::new("cli", RoomType::Direct, "unit");
        let session = h.runtime.services.sessions.get(&key).unwrap();
        let session = session.lock().await;
        let roles: Vec<TurnRole> = session.transcript.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![
                TurnRole::User,
                TurnRole::Assistant, // tool call
                TurnRole::Tool,      // tool result
                TurnRole::Assistant, // final
            ]
        );
        assert!(session.transcript[2].content.contains("Saved to memory"));
        assert!(session.working.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parse_failure_gets_a_correction_turn() {
        let h = harness(vec![
            ScriptedAction::Complete("I think I should probably search memory.".into()),
            ScriptedAction::Complete(response_json("done")),
        ]);

        let reply = h
            .runtime
            .submit_and_wait(inbound("hello"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reply, "done");

        let key = SessionKey::new("cli", RoomType::Direct, "unit");
        let session = h.runtime.services.sessions.get(&key).unwrap();
        let session = session.lock().await;
        assert!(session
            .transcript
            .iter()
            .any(|t| t.role == TurnRole::System && t.content.contains("could not be parsed")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn three_consecutive_parse_failures_terminate() {
        let h = harness(vec![
            ScriptedAction::Complete("prose one".into()),
            ScriptedAction::Complete("prose two".into()),
            ScriptedAction::Complete("prose three".into()),
        ]);

        let reply = h
            .runtime
            .submit_and_wait(inbound("hello"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(reply.contains("structured intent"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn messages_in_one_session_process_in_fifo_order() {
        let h = harness(vec![
            ScriptedAction::Complete(response_json("first answer")),
            ScriptedAction::Complete(response_json("second answer")),
        ]);

        let mut events = h.runtime.subscribe();
        h.runtime.enqueue_message(inbound("first")).unwrap();
        h.runtime.enqueue_message(inbound("second")).unwrap();

        let mut finals = Vec::new();
        while finals.len() < 2 {
            if let Ok(ProgressEvent::Final { text, .. }) =
                tokio::time::timeout(Duration::from_secs(10), events.recv())
                    .await
                    .expect("timed out")
            {
                finals.push(text);
            }
        }
        assert_eq!(finals, vec!["first answer", "second answer"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delegation_merges_sub_agent_output() {
        let h = harness(vec![
            // Parent asks for a delegation.
            ScriptedAction::Complete(tool_json(
                "delegate_task",
                serde_json::json!({
                    "profile": "researcher",
                    "subtasks": ["find the port"],
                    "strategy": "parallel",
                    "wait": "first",
                    "merge": "concat"
                }),
            )),
            // The sub-agent answers immediately.
            ScriptedAction::Complete(response_json("sub-agent: the port is 48920")),
            // Parent wraps up.
            ScriptedAction::Complete(response_json("The port is 48920.")),
        ]);

        let reply = h
            .runtime
            .submit_and_wait(inbound("delegate please"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reply, "The port is 48920.");

        // The sub-agent's raw output reached the parent only through the
        // merged tool result.
        let key = SessionKey::new("cli", RoomType::Direct, "unit");
        let session = h.runtime.services.sessions.get(&key).unwrap();
        let session = session.lock().await;
        let tool_turn = session
            .transcript
            .iter()
            .find(|t| t.role == TurnRole::Tool)
            .unwrap();
        assert!(tool_turn.content.contains("sub-agent: the port is 48920"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delegating_to_own_profile_is_rejected() {
        let profile = SubAgentProfile {
            name: "primary".into(),
            role: ModelRole::Chat,
            tool_allowlist: vec!["response".into()],
            max_iterations: 2,
            system_overlay: String::new(),
        };
        let h = harness_with_profiles(vec![], vec![profile]);

        let key = SessionKey::new("cli", RoomType::Direct, "self-spawn");
        let principal = Principal::new("tester", Role::Owner);
        let spawner = h.runtime.coordinator.spawner_for(
            &key,
            &principal,
            "primary",
            tokio_util::sync::CancellationToken::new(),
        );

        let err = spawner
            .delegate(itak_tools::DelegationRequest {
                profile: "primary".into(),
                subtasks: vec!["clone yourself".into()],
                strategy: itak_tools::SpawnStrategy::Parallel,
                wait: itak_tools::WaitMode::All,
                merge: itak_tools::MergeStrategy::Concat,
                context: String::new(),
                timeout_secs: 10,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid delegation"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resume_injects_a_system_turn() {
        let h = harness(vec![]);
        let key = SessionKey::new("cli", RoomType::Direct, "resumed");
        let working = {
            let mut w = itak_core::WorkingContext::new(itak_core::TaskId::new());
            w.current_step = 2;
            w
        };
        let record = itak_checkpoint::CheckpointRecord::new(key.clone(), working, 3)
            .with_history_tail(vec![Turn::user("original ask")]);
        h.runtime
            .services
            .checkpoints
            .checkpoint_forced(&record)
            .await
            .unwrap();

        let principal = Principal::new("tester", Role::Owner);
        let resolver_principal = principal.clone();
        h.runtime
            .resume_all(move |_| Some(resolver_principal.clone()))
            .await;

        let session = h.runtime.services.sessions.get(&key).unwrap();
        let session = session.lock().await;
        assert!(session
            .transcript
            .iter()
            .any(|t| t.role == TurnRole::System && t.content.contains("resuming")));
        assert!(session.working.is_some());
        assert_eq!(session.working.as_ref().unwrap().current_step, 2);
    }
}
