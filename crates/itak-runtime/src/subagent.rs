//! Sub-agent coordination: swarm scheduling, merging, cancellation.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use itak_checkpoint::CheckpointRecord;
use itak_core::{Principal, RoomType, SessionKey, Turn, WorkingContext};
use itak_llm::{ChatRequest, Message, ModelRole};
use itak_tools::{
    DelegationRequest, MergeStrategy, SpawnStrategy, SubAgentSpawner, Tool, ToolContext,
    ToolError, WaitMode,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::intent::{IntentOutcome, parse_intent};
use crate::runtime::AgentRuntime;

/// A custom reducer registered for `MergeStrategy::Custom`.
type Reducer = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

/// Profile a sub-agent runs under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentProfile {
    /// Profile name; `delegate_task` selects by it.
    pub name: String,
    /// Model tier the sub-agent reasons with.
    pub role: ModelRole,
    /// Tools the sub-agent may call.
    pub tool_allowlist: Vec<String>,
    /// Iteration budget, typically smaller than the parent's.
    pub max_iterations: u32,
    /// System prompt overlay.
    pub system_overlay: String,
}

impl SubAgentProfile {
    /// A research-flavored default profile.
    #[must_use]
    pub fn researcher() -> Self {
        Self {
            name: "researcher".into(),
            role: ModelRole::Chat,
            tool_allowlist: vec![
                "web_search".into(),
                "browser".into(),
                "memory_load".into(),
                "response".into(),
            ],
            max_iterations: 6,
            system_overlay: "You are a focused research sub-agent. Gather facts for the \
                             subtask and finish with the response tool."
                .into(),
        }
    }
}

/// Orchestrates swarms of sub-agents for the `delegate_task` tool.
pub struct SubAgentCoordinator {
    runtime: Weak<AgentRuntime>,
    profiles: HashMap<String, SubAgentProfile>,
    permits: Arc<Semaphore>,
    max_depth: usize,
    sub_counters: DashMap<SessionKey, usize>,
    reducers: DashMap<String, Reducer>,
}

impl SubAgentCoordinator {
    /// Create a coordinator over the runtime.
    #[must_use]
    pub fn new(runtime: Weak<AgentRuntime>, profiles: Vec<SubAgentProfile>) -> Self {
        Self {
            runtime,
            profiles: profiles.into_iter().map(|p| (p.name.clone(), p)).collect(),
            permits: Arc::new(Semaphore::new(4)),
            max_depth: 2,
            sub_counters: DashMap::new(),
            reducers: DashMap::new(),
        }
    }

    /// Register a custom reducer under a name (used when the delegation
    /// asks for `merge: custom`).
    pub fn register_reducer(&self, name: impl Into<String>, reducer: Reducer) {
        self.reducers.insert(name.into(), reducer);
    }

    /// Build the spawner handle injected into a turn's [`ToolContext`].
    /// The monologue's cancellation token is the swarm's parent scope.
    #[must_use]
    pub fn spawner_for(
        self: &Arc<Self>,
        parent_session: &SessionKey,
        principal: &Principal,
        parent_profile: &str,
        cancel: CancellationToken,
    ) -> Arc<dyn SubAgentSpawner> {
        Arc::new(SpawnHandle {
            coordinator: Arc::clone(self),
            parent_session: parent_session.clone(),
            principal: principal.clone(),
            parent_profile: parent_profile.to_string(),
            depth: 0,
            cancel,
        })
    }

    /// Like [`spawner_for`](Self::spawner_for) but with an explicit parent
    /// cancellation scope and depth (nested delegations).
    #[must_use]
    pub fn scoped_spawner(
        self: &Arc<Self>,
        parent_session: &SessionKey,
        principal: &Principal,
        parent_profile: &str,
        depth: usize,
        cancel: CancellationToken,
    ) -> Arc<dyn SubAgentSpawner> {
        Arc::new(SpawnHandle {
            coordinator: Arc::clone(self),
            parent_session: parent_session.clone(),
            principal: principal.clone(),
            parent_profile: parent_profile.to_string(),
            depth,
            cancel,
        })
    }

    fn next_sub_index(&self, parent: &SessionKey) -> usize {
        let mut entry = self.sub_counters.entry(parent.clone()).or_insert(0);
        let n = *entry;
        *entry = entry.saturating_add(1);
        n
    }
}

impl std::fmt::Debug for SubAgentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentCoordinator")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

/// Per-turn spawner handle. Carries the parent's cancellation scope so
/// cancellation cascades into the whole swarm.
struct SpawnHandle {
    coordinator: Arc<SubAgentCoordinator>,
    parent_session: SessionKey,
    principal: Principal,
    parent_profile: String,
    depth: usize,
    cancel: CancellationToken,
}

#[async_trait]
impl SubAgentSpawner for SpawnHandle {
    async fn delegate(&self, request: DelegationRequest) -> Result<String, ToolError> {
        let coordinator = &self.coordinator;
        let profile = coordinator
            .profiles
            .get(&request.profile)
            .ok_or_else(|| {
                ToolError::InvalidArgs(format!(
                    "invalid delegation: unknown profile '{}'",
                    request.profile
                ))
            })?
            .clone();

        // Recursive cloning guard: a sub-agent of the caller's own profile
        // is rejected.
        if profile.name == self.parent_profile {
            return Err(ToolError::InvalidArgs(format!(
                "invalid delegation: profile '{}' matches the caller",
                profile.name
            )));
        }
        if self.depth >= coordinator.max_depth {
            return Err(ToolError::InvalidArgs(format!(
                "invalid delegation: depth {} exceeds the limit",
                self.depth
            )));
        }

        let swarm_cancel = self.cancel.child_token();
        let outcome = tokio::time::timeout(
            request.timeout(),
            self.run_swarm(&profile, &request, &swarm_cancel),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                swarm_cancel.cancel();
                Err(ToolError::Timeout(request.timeout()))
            },
        }
    }
}

impl SpawnHandle {
    async fn run_swarm(
        &self,
        profile: &SubAgentProfile,
        request: &DelegationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let outputs = match request.strategy {
            SpawnStrategy::Parallel => self.run_parallel(profile, request, cancel).await?,
            // Pipeline shares the sequential skeleton: each sub-agent's
            // output seeds the next prompt as it becomes available.
            SpawnStrategy::Sequential | SpawnStrategy::Pipeline => {
                self.run_sequential(profile, request, cancel).await?
            },
        };
        self.merge(request, &outputs).await
    }

    async fn run_parallel(
        &self,
        profile: &SubAgentProfile,
        request: &DelegationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ToolError> {
        let mut tasks = FuturesUnordered::new();
        let mut peer_tokens = Vec::new();

        for subtask in &request.subtasks {
            let token = cancel.child_token();
            peer_tokens.push(token.clone());
            let subtask = subtask.clone();
            let context = request.context.clone();
            let profile = profile.clone();
            let this = self.clone_parts();
            tasks.push(async move {
                let result = this.run_one(&profile, &subtask, &context, &token).await;
                (subtask, result)
            });
        }

        match request.wait {
            WaitMode::First => {
                // First success wins; outstanding peers are cancelled.
                let mut errors = Vec::new();
                while let Some((_, result)) = tasks.next().await {
                    match result {
                        Ok(output) => {
                            for token in &peer_tokens {
                                token.cancel();
                            }
                            return Ok(vec![output]);
                        },
                        Err(e) => errors.push(e.to_string()),
                    }
                }
                Err(ToolError::Execution(format!(
                    "every sub-agent failed: {}",
                    errors.join("; ")
                )))
            },
            WaitMode::All => {
                // Peers are never cancelled; failures aggregate.
                let mut outputs = Vec::new();
                let mut errors = Vec::new();
                while let Some((subtask, result)) = tasks.next().await {
                    match result {
                        Ok(output) => outputs.push(output),
                        Err(e) => errors.push(format!("{subtask}: {e}")),
                    }
                }
                if errors.is_empty() {
                    Ok(outputs)
                } else {
                    Err(ToolError::Execution(format!(
                        "sub-agent failures: {}",
                        errors.join("; ")
                    )))
                }
            },
        }
    }

    async fn run_sequential(
        &self,
        profile: &SubAgentProfile,
        request: &DelegationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ToolError> {
        let mut outputs: Vec<String> = Vec::new();
        for subtask in &request.subtasks {
            let seeded = if let Some(prior) = outputs.last() {
                format!("{subtask}\n\nOutput of the previous step:\n{prior}")
            } else {
                subtask.clone()
            };
            let output = self
                .run_one(profile, &seeded, &request.context, &cancel.child_token())
                .await?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    fn clone_parts(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            parent_session: self.parent_session.clone(),
            principal: self.principal.clone(),
            parent_profile: self.parent_profile.clone(),
            depth: self.depth,
            cancel: self.cancel.clone(),
        }
    }

    /// Run a single sub-agent monologue to completion.
    async fn run_one(
        &self,
        profile: &SubAgentProfile,
        subtask: &str,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let coordinator = &self.coordinator;
        let runtime = coordinator
            .runtime
            .upgrade()
            .ok_or_else(|| ToolError::Execution("runtime shut down".into()))?;
        let _permit = coordinator
            .permits
            .acquire()
            .await
            .map_err(|_| ToolError::Execution("coordinator closed".into()))?;

        let n = coordinator.next_sub_index(&self.parent_session);
        let sub_key = SessionKey::new(
            self.parent_session.channel(),
            RoomType::Sub,
            format!("{}-sub-{n}", self.parent_session.room_id()),
        );
        info!(parent = %self.parent_session, sub = %sub_key, profile = %profile.name, "Sub-agent starting");

        // Own session, own transcript, own checkpoint namespace; the
        // parent only holds this cancellation token and the result.
        let mut transcript: Vec<Turn> = Vec::new();
        transcript.push(Turn::user(format!(
            "{context}\n\nSubtask: {subtask}"
        )));
        let mut working = WorkingContext::new(itak_core::TaskId::new());

        let services = runtime.services();
        let tool_block: String = {
            let registry = services.executor.registry();
            registry
                .visible_for(self.principal.role)
                .iter()
                .filter(|t| profile.tool_allowlist.iter().any(|a| a == t.spec().name))
                .map(|t| format!("## {}\n{}\n", t.spec().name, t.spec().usage_prompt))
                .collect()
        };

        for iteration in 1..=profile.max_iterations {
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            working.iteration_count = iteration;

            let system = format!(
                "{}\n# Tools\n{tool_block}\nReply with exactly one JSON object \
                 {{\"tool\": \"<name>\", \"args\": {{...}}}}.",
                profile.system_overlay
            );
            let messages: Vec<Message> = transcript
                .iter()
                .map(|t| match t.role {
                    itak_core::TurnRole::Assistant => Message::assistant(&t.content),
                    itak_core::TurnRole::Tool => Message::tool(&t.content),
                    _ => Message::user(&t.content),
                })
                .collect();
            let request = ChatRequest::new(system, messages).max_tokens(1024);

            let response = services
                .router
                .complete(profile.role, self.principal.id, &request)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;
            let text = services.guard.redact(&response.text);

            match parse_intent(&text) {
                IntentOutcome::Response { text } => {
                    debug!(sub = %sub_key, "Sub-agent finished");
                    return Ok(text);
                },
                IntentOutcome::Tool { name, args } => {
                    transcript.push(Turn::assistant(text.clone()));
                    if !profile.tool_allowlist.iter().any(|a| a == &name) {
                        transcript.push(Turn::tool(format!(
                            "ERROR: tool '{name}' is not on this profile's allowlist"
                        )));
                        continue;
                    }

                    let ctx = self
                        .sub_tool_context(&runtime, &sub_key, profile, iteration, cancel)
                        .await;
                    let record =
                        CheckpointRecord::new(sub_key.clone(), working.clone(), iteration);
                    if let Err(e) = services.checkpoints.checkpoint(&record).await {
                        warn!(error = %e, "Sub-agent checkpoint failed");
                    }

                    match services.executor.dispatch(&name, args, &ctx, cancel).await {
                        Ok(output) => {
                            working.complete_step(output.content.chars().take(80).collect::<String>());
                            transcript.push(Turn::tool(output.content));
                        },
                        Err(ToolError::Cancelled) => return Err(ToolError::Cancelled),
                        Err(e) => {
                            // Sub-agents fail fast; the parent's merge
                            // strategy decides what a failure means.
                            transcript.push(Turn::tool(format!("ERROR: {e}")));
                        },
                    }
                },
                IntentOutcome::ParseError { reason } => {
                    transcript.push(Turn::system(format!(
                        "Unparseable output ({reason}); reply with one JSON object."
                    )));
                },
            }
        }
        Err(ToolError::Execution(format!(
            "sub-agent '{}' exhausted {} iterations",
            profile.name, profile.max_iterations
        )))
    }

    async fn sub_tool_context(
        &self,
        runtime: &Arc<AgentRuntime>,
        sub_key: &SessionKey,
        profile: &SubAgentProfile,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> ToolContext {
        let services = runtime.services();
        let mut ctx = ToolContext::new(
            self.principal.clone(),
            sub_key.clone(),
            services.work_root.join(sub_key.as_path_segment()),
            services.sessions.media_dir(sub_key),
            Arc::clone(&services.vault),
            services.guard.clone(),
            services.fabric.clone(),
            Arc::clone(&services.graph),
            services.ssrf.clone(),
        );
        ctx.set_iteration(iteration);
        // Nested delegation keeps the chain: deeper scope, same cascade.
        let spawner = self.coordinator.scoped_spawner(
            sub_key,
            &self.principal,
            &profile.name,
            self.depth.saturating_add(1),
            cancel.clone(),
        );
        ctx.set_spawner(Some(spawner)).await;
        ctx
    }

    async fn merge(
        &self,
        request: &DelegationRequest,
        outputs: &[String],
    ) -> Result<String, ToolError> {
        if outputs.is_empty() {
            return Err(ToolError::Execution("swarm produced no output".into()));
        }
        if outputs.len() == 1 {
            return Ok(outputs[0].clone());
        }

        match request.merge {
            MergeStrategy::Concat => Ok(outputs
                .iter()
                .enumerate()
                .map(|(i, o)| format!("## Result {}\n{o}", i.saturating_add(1)))
                .collect::<Vec<_>>()
                .join("\n\n")),
            MergeStrategy::Summarize => self.utility_merge(
                "Merge these sub-agent results into one coherent answer. Keep every \
                 concrete fact.",
                outputs,
            )
            .await,
            MergeStrategy::Best => self.utility_merge(
                "These are alternative answers to the same task. Return the single \
                 best one, verbatim.",
                outputs,
            )
            .await,
            MergeStrategy::Custom => {
                if let Some(reducer) = self.coordinator.reducers.get(&request.profile) {
                    Ok(reducer(outputs))
                } else {
                    warn!(profile = %request.profile, "No custom reducer registered, concatenating");
                    Ok(outputs.join("\n\n"))
                }
            },
        }
    }

    async fn utility_merge(
        &self,
        instruction: &str,
        outputs: &[String],
    ) -> Result<String, ToolError> {
        let runtime = self
            .coordinator
            .runtime
            .upgrade()
            .ok_or_else(|| ToolError::Execution("runtime shut down".into()))?;
        let joined = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| format!("--- candidate {} ---\n{o}", i.saturating_add(1)))
            .collect::<Vec<_>>()
            .join("\n");
        let request = ChatRequest::new(instruction, vec![Message::user(joined)]).max_tokens(800);
        runtime
            .services()
            .router
            .complete(ModelRole::Utility, self.principal.id, &request)
            .await
            .map(|r| r.text)
            .map_err(|e| ToolError::Execution(format!("merge failed: {e}")))
    }
}
