//! The repair loop.

use async_trait::async_trait;
use dashmap::DashMap;
use itak_core::{ErrorKind, PrincipalId, SessionKey, SurfacedError};
use itak_llm::{ChatRequest, Message, ModelRole, ModelRouter};
use itak_memory::{MemoryFabric, RememberOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::classify::{ErrorCategory, classify, signature};

/// Tag under which repair outcomes are persisted to memory.
const SOLUTION_TAG: &str = "self_heal_solution";

/// Healing budgets and backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealConfig {
    /// Retries allowed per distinct error signature.
    pub max_retries_per_error: u32,
    /// Retries allowed per session, across all errors.
    pub max_retries_per_session: u32,
    /// Backoff per attempt, seconds. Attempts beyond the list reuse the
    /// final entry.
    pub backoff_secs: Vec<u64>,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            max_retries_per_error: 3,
            max_retries_per_session: 10,
            backoff_secs: vec![1, 5, 15],
        }
    }
}

/// A selected repair strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairStrategy {
    /// One-line plan the scheduler injects before retrying.
    pub plan: String,
    /// Where the strategy came from.
    pub source: StrategySource,
}

/// Provenance of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySource {
    /// Found in the repair memory with a prior success.
    Memory,
    /// Proposed by the utility model.
    Model,
    /// Extracted from bounded web research.
    Research,
    /// Plain retry with no setup.
    Retry,
}

/// The verdict for one error occurrence.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Retry the failed operation after `backoff`, following `strategy`.
    Retry {
        /// The chosen strategy.
        strategy: RepairStrategy,
        /// Delay before the retry.
        backoff: Duration,
    },
    /// Give up and report to the user.
    Surface(SurfacedError),
    /// Stop immediately; no retry is ever safe.
    Fatal(SurfacedError),
}

/// One failed call, as reported by the scheduler.
#[derive(Debug, Clone)]
pub struct HealContext {
    /// Session the failure happened in.
    pub session: SessionKey,
    /// Principal the work runs for.
    pub principal: PrincipalId,
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
    /// Task step, for the surfaced report.
    pub step: Option<usize>,
}

/// Optional bounded research probe (wired to the web tools by the
/// runtime). Returned candidate strategies are plain text; nothing
/// fetched is ever executed directly.
#[async_trait]
pub trait StrategyResearcher: Send + Sync {
    /// Research the error and return up to three candidate strategies.
    async fn research(&self, category: ErrorCategory, message: &str) -> Vec<String>;
}

#[derive(Debug, Default)]
struct SessionBudget {
    total: u32,
}

/// The self-healing engine. Shared across sessions.
pub struct HealingEngine {
    fabric: MemoryFabric,
    router: ModelRouter,
    researcher: Option<Arc<dyn StrategyResearcher>>,
    config: HealConfig,
    session_budgets: DashMap<SessionKey, SessionBudget>,
    error_attempts: DashMap<(SessionKey, String), u32>,
    cleanup_attempted: DashMap<(SessionKey, String), ()>,
}

impl HealingEngine {
    /// Create an engine over the fabric and router.
    #[must_use]
    pub fn new(fabric: MemoryFabric, router: ModelRouter, config: HealConfig) -> Self {
        Self {
            fabric,
            router,
            researcher: None,
            config,
            session_budgets: DashMap::new(),
            error_attempts: DashMap::new(),
            cleanup_attempted: DashMap::new(),
        }
    }

    /// Attach a research probe.
    #[must_use]
    pub fn with_researcher(mut self, researcher: Arc<dyn StrategyResearcher>) -> Self {
        self.researcher = Some(researcher);
        self
    }

    /// Drop all budget state for a finished session.
    pub fn reset_session(&self, session: &SessionKey) {
        self.session_budgets.remove(session);
        self.error_attempts.retain(|(s, _), _| s != session);
        self.cleanup_attempted.retain(|(s, _), _| s != session);
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let secs = self
            .config
            .backoff_secs
            .get(index)
            .or(self.config.backoff_secs.last())
            .copied()
            .unwrap_or(1);
        Duration::from_secs(secs)
    }

    /// Decide what to do about a failure.
    pub async fn handle(&self, ctx: &HealContext) -> Decision {
        let category = classify(ctx.kind, &ctx.message);
        let sig = signature(&ctx.message);
        debug!(category = %category, signature = %sig, "Classifying failure");

        if category.is_fatal() {
            return Decision::Fatal(
                surfaced(ctx, format!("{category} error: {}", ctx.message)),
            );
        }

        if category == ErrorCategory::Resource {
            // One cleanup attempt, then surface.
            let key = (ctx.session.clone(), sig.clone());
            if self.cleanup_attempted.insert(key, ()).is_none() {
                return Decision::Retry {
                    strategy: RepairStrategy {
                        plan: "Free scratch space and close unused handles, then retry the \
                               operation once."
                            .into(),
                        source: StrategySource::Retry,
                    },
                    backoff: self.backoff_for(1),
                };
            }
            return Decision::Surface(surfaced(ctx, format!("resource exhausted: {}", ctx.message)));
        }

        if !category.is_repairable() || !retriable_kind(ctx.kind) {
            return Decision::Surface(surfaced(ctx, ctx.message.clone()));
        }

        // Budget checks.
        let attempt = {
            let mut entry = self
                .error_attempts
                .entry((ctx.session.clone(), sig.clone()))
                .or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        let session_total = {
            let mut entry = self
                .session_budgets
                .entry(ctx.session.clone())
                .or_default();
            entry.total = entry.total.saturating_add(1);
            entry.total
        };
        if attempt > self.config.max_retries_per_error
            || session_total > self.config.max_retries_per_session
        {
            warn!(signature = %sig, attempt, session_total, "Retry budget exhausted");
            return Decision::Surface(surfaced(
                ctx,
                format!("retry budget exhausted after {attempt} attempts: {}", ctx.message),
            ));
        }

        let strategy = self.select_strategy(ctx, category, &sig).await;
        info!(
            signature = %sig,
            attempt,
            source = ?strategy.source,
            "Retrying with strategy"
        );
        Decision::Retry {
            strategy,
            backoff: self.backoff_for(attempt),
        }
    }

    /// Strategy selection: repair memory, then the utility model, then
    /// research, then a plain retry.
    async fn select_strategy(
        &self,
        ctx: &HealContext,
        category: ErrorCategory,
        sig: &str,
    ) -> RepairStrategy {
        // 1. Prior solution in the repair memory: O(1) on re-occurrence.
        if let Ok(hits) = self
            .fabric
            .search(ctx.principal, &format!("{SOLUTION_TAG} {category} {sig}"), 3)
            .await
        {
            if let Some(hit) = hits
                .iter()
                .find(|e| e.tags.iter().any(|t| t == SOLUTION_TAG))
            {
                return RepairStrategy {
                    plan: hit.content.clone(),
                    source: StrategySource::Memory,
                };
            }
        }

        // 2. Ask the utility model for candidates.
        let request = ChatRequest::new(
            "A tool call failed. Propose up to 3 short repair strategies, one per \
             line, most promising first. No commentary.",
            vec![Message::user(format!(
                "category: {category}\nerror: {}",
                ctx.message
            ))],
        )
        .max_tokens(200);
        if let Ok(response) = self
            .router
            .complete(ModelRole::Utility, ctx.principal, &request)
            .await
        {
            if let Some(first) = response
                .text
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
            {
                return RepairStrategy {
                    plan: first.to_string(),
                    source: StrategySource::Model,
                };
            }
        }

        // 3. Bounded research.
        if let Some(researcher) = &self.researcher {
            let candidates = researcher.research(category, &ctx.message).await;
            if let Some(first) = candidates.into_iter().next() {
                return RepairStrategy {
                    plan: first,
                    source: StrategySource::Research,
                };
            }
        }

        RepairStrategy {
            plan: "Retry the operation unchanged.".into(),
            source: StrategySource::Retry,
        }
    }

    /// Persist a working repair so the next occurrence of this signature
    /// resolves from memory.
    pub async fn record_success(&self, ctx: &HealContext, strategy: &RepairStrategy) {
        let category = classify(ctx.kind, &ctx.message);
        let sig = signature(&ctx.message);
        let content = format!("{SOLUTION_TAG} {category} {sig} => {}", strategy.plan);
        let result = self
            .fabric
            .remember(
                ctx.principal,
                &content,
                RememberOptions {
                    tags: vec![SOLUTION_TAG.to_string(), category.to_string()],
                    ..RememberOptions::default()
                },
            )
            .await;
        match result {
            Ok(id) => info!(id = %id, signature = %sig, "Repair recorded"),
            Err(e) => warn!(error = %e, "Failed to record repair"),
        }
        // A solved error frees its per-signature budget.
        self.error_attempts.remove(&(ctx.session.clone(), sig));
    }
}

impl std::fmt::Debug for HealingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealingEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn surfaced(ctx: &HealContext, message: String) -> SurfacedError {
    let mut report = SurfacedError::new(ctx.kind, message);
    if let Some(step) = ctx.step {
        report = report.at_step(step);
    }
    report
}

/// Kinds the healer may retry at all. `InvalidArgs`, permission problems,
/// and policy violations never reach a retry.
fn retriable_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ProviderTransient
            | ErrorKind::Timeout
            | ErrorKind::RateLimited
            | ErrorKind::InternalInvariant
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use itak_limits::{LimiterConfig, RateLimiter};
    use itak_llm::{ModelBinding, ScriptedProvider};
    use itak_memory::MemoryConfig;
    use itak_store::{MemGraphStore, MemRelationalStore, MemVectorStore};
    use itak_core::RoomType;

    fn engine(utility_script: Vec<itak_llm::ScriptedAction>) -> HealingEngine {
        let provider = Arc::new(ScriptedProvider::new("scripted", utility_script));
        let router = ModelRouter::builder()
            .provider(provider)
            .role(
                ModelRole::Utility,
                vec![ModelBinding::new("scripted", "utility").free_model()],
            )
            .role(
                ModelRole::Embedding,
                vec![ModelBinding::new("scripted", "embedder").free_model()],
            )
            .build(Arc::new(RateLimiter::new(LimiterConfig::default())));
        let fabric = MemoryFabric::new(
            Arc::new(MemRelationalStore::new()),
            Arc::new(MemGraphStore::new()),
            Arc::new(MemVectorStore::new()),
            router.clone(),
            MemoryConfig {
                model_extraction: false,
                ..MemoryConfig::default()
            },
            None,
        );
        HealingEngine::new(fabric, router, HealConfig::default())
    }

    fn ctx(kind: ErrorKind, message: &str) -> HealContext {
        HealContext {
            session: SessionKey::new("cli", RoomType::Direct, "heal"),
            principal: PrincipalId::new(),
            kind,
            message: message.to_string(),
            step: Some(2),
        }
    }

    #[tokio::test]
    async fn security_is_fatal() {
        let engine = engine(vec![]);
        let decision = engine
            .handle(&ctx(ErrorKind::PolicyViolation, "ssrf: target is private"))
            .await;
        assert!(matches!(decision, Decision::Fatal(_)));
    }

    #[tokio::test]
    async fn invalid_args_surface_without_retry() {
        let engine = engine(vec![]);
        let decision = engine
            .handle(&ctx(ErrorKind::InvalidArgs, "missing field 'url'"))
            .await;
        assert!(matches!(decision, Decision::Surface(_)));
    }

    #[tokio::test]
    async fn per_error_budget_exhausts_after_three() {
        let engine = engine(vec![]);
        let failure = ctx(ErrorKind::Timeout, "upstream timed out");
        for attempt in 1..=3u32 {
            match engine.handle(&failure).await {
                Decision::Retry { backoff, .. } => {
                    let expected = [1u64, 5, 15][attempt as usize - 1];
                    assert_eq!(backoff, Duration::from_secs(expected));
                },
                other => panic!("attempt {attempt}: expected retry, got {other:?}"),
            }
        }
        assert!(matches!(
            engine.handle(&failure).await,
            Decision::Surface(_)
        ));
    }

    #[tokio::test]
    async fn resource_gets_one_cleanup_then_surfaces() {
        let engine = engine(vec![]);
        let failure = ctx(ErrorKind::ProviderTransient, "write failed: no space left");
        assert!(matches!(
            engine.handle(&failure).await,
            Decision::Retry { .. }
        ));
        assert!(matches!(
            engine.handle(&failure).await,
            Decision::Surface(_)
        ));
    }

    #[tokio::test]
    async fn recorded_repairs_are_reused_from_memory() {
        let engine = engine(vec![]);
        let failure = ctx(
            ErrorKind::ProviderTransient,
            "bash: ffprobe: command not found",
        );

        let strategy = RepairStrategy {
            plan: "install ffmpeg before retrying".into(),
            source: StrategySource::Model,
        };
        engine.record_success(&failure, &strategy).await;
        engine
            .fabric
            .flush_derivations(Duration::from_secs(2))
            .await;

        match engine.handle(&failure).await {
            Decision::Retry { strategy, .. } => {
                assert_eq!(strategy.source, StrategySource::Memory);
                assert!(strategy.plan.contains("install ffmpeg"));
            },
            other => panic!("expected memory-backed retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_reset_clears_budgets() {
        let engine = engine(vec![]);
        let failure = ctx(ErrorKind::Timeout, "flaky upstream");
        for _ in 0..3 {
            let _ = engine.handle(&failure).await;
        }
        engine.reset_session(&failure.session);
        assert!(matches!(
            engine.handle(&failure).await,
            Decision::Retry { .. }
        ));
    }
}
