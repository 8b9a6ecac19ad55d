//! The memory fabric.

use chrono::Utc;
use dashmap::DashMap;
use itak_core::{MemoryEntry, MemoryId, MemoryTier, PrincipalId, Priority, SessionKey, Turn};
use itak_llm::{ChatRequest, Message, ModelRole, ModelRouter};
use itak_store::{GraphStore, RelationalStore, StoreHealth, VectorStore, content_hash};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core_tier::CoreContext;
use crate::derive::{DerivationJob, DerivationTracker};
use crate::error::{MemoryError, MemoryResult};
use crate::extract::{Extraction, extract_heuristic, parse_model_extraction, query_terms};
use crate::ranker::{bm25_scores, fuse};

/// Hybrid ranker weights: `score = vector·α + bm25·β + graph·γ`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankerWeights {
    /// Vector similarity weight (α).
    pub vector: f32,
    /// BM25 weight (β).
    pub bm25: f32,
    /// Graph proximity weight (γ).
    pub graph: f32,
}

impl Default for RankerWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            bm25: 0.3,
            graph: 0.2,
        }
    }
}

/// Fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Ranker weights.
    #[serde(default)]
    pub ranker: RankerWeights,
    /// Window within which identical content dedups to one entry, seconds.
    pub dedup_window_secs: u64,
    /// Context utilization that triggers turn compression.
    pub soft_pressure: f32,
    /// Context utilization that triggers recall demotion.
    pub hard_pressure: f32,
    /// Accesses within residency that mirror an archival entry back into
    /// recall.
    pub promote_threshold: u64,
    /// Entries demoted per hard-pressure pass.
    pub demote_batch: usize,
    /// Maximum graph hops on the search leg.
    pub graph_hops: u8,
    /// Relational candidates fetched per search.
    pub candidate_limit: usize,
    /// Derivation attempts before an entry stalls.
    pub derivation_max_attempts: u32,
    /// Ask the utility model for entity/tag extraction before falling back
    /// to heuristics.
    pub model_extraction: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ranker: RankerWeights::default(),
            dedup_window_secs: 300,
            soft_pressure: 0.75,
            hard_pressure: 0.90,
            promote_threshold: 3,
            demote_batch: 16,
            graph_hops: 2,
            candidate_limit: 64,
            derivation_max_attempts: 3,
            model_extraction: true,
        }
    }
}

/// Options for a save.
#[derive(Debug, Clone, Default)]
pub struct RememberOptions {
    /// Retention priority.
    pub priority: Priority,
    /// Extra tags beyond the extracted ones.
    pub tags: Vec<String>,
    /// Originating session.
    pub source_session: Option<SessionKey>,
}

/// Health snapshot of the fabric and its tiers.
#[derive(Debug, Clone, Serialize)]
pub struct FabricHealth {
    /// Recall tier.
    pub relational: StoreHealth,
    /// Archival graph tier.
    pub graph: StoreHealth,
    /// Archival vector tier.
    pub vector: StoreHealth,
    /// Entries with unconverged archival derivation.
    pub pending_derivations: usize,
}

struct FabricInner {
    relational: Arc<dyn RelationalStore>,
    graph: Arc<dyn GraphStore>,
    vector: Arc<dyn VectorStore>,
    router: ModelRouter,
    config: MemoryConfig,
    core: Option<CoreContext>,
    tracker: DerivationTracker,
    job_tx: mpsc::Sender<DerivationJob>,
    /// Per-entry write serialization within the recall tier.
    entry_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

/// The tiered memory fabric. Cheap to clone.
#[derive(Clone)]
pub struct MemoryFabric {
    inner: Arc<FabricInner>,
}

impl std::fmt::Debug for MemoryFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFabric")
            .field("pending_derivations", &self.inner.tracker.pending_count())
            .finish_non_exhaustive()
    }
}

impl MemoryFabric {
    /// Build a fabric over the given adapters and spawn its derivation
    /// worker. Must be called on a tokio runtime.
    #[must_use]
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        graph: Arc<dyn GraphStore>,
        vector: Arc<dyn VectorStore>,
        router: ModelRouter,
        config: MemoryConfig,
        core: Option<CoreContext>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<DerivationJob>(256);
        let inner = Arc::new(FabricInner {
            relational,
            graph,
            vector,
            router,
            config,
            core,
            tracker: DerivationTracker::default(),
            job_tx,
            entry_locks: DashMap::new(),
        });
        tokio::spawn(derivation_worker(Arc::clone(&inner), job_rx));
        Self { inner }
    }

    /// Read the core tier for prompt assembly. Re-read on every call so
    /// on-disk edits are honored at the next session start.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CoreTier`] if the directory cannot be read.
    pub fn core_context(&self) -> MemoryResult<String> {
        match &self.inner.core {
            Some(core) => core.read_all(),
            None => Ok(String::new()),
        }
    }

    async fn entry_lock(&self, id: MemoryId) -> Arc<Mutex<()>> {
        self.inner
            .entry_locks
            .entry(id.0)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn extract(&self, principal: PrincipalId, content: &str) -> Extraction {
        if self.inner.config.model_extraction {
            let request = ChatRequest::new(
                "Extract entities and tags from the text. Reply with bare JSON: \
                 {\"entities\": [...], \"tags\": [...]}",
                vec![Message::user(content)],
            )
            .max_tokens(256);
            match self
                .inner
                .router
                .complete(ModelRole::Utility, principal, &request)
                .await
            {
                Ok(response) => {
                    if let Some(extraction) = parse_model_extraction(&response.text) {
                        return extraction;
                    }
                    debug!("Utility extraction unparseable, using heuristics");
                },
                Err(e) => debug!(error = %e, "Utility extraction failed, using heuristics"),
            }
        }
        extract_heuristic(content)
    }

    /// Save a memory. Write-through to recall; archival derivation is
    /// enqueued and converges in the background.
    ///
    /// Two saves with identical content inside the dedup window converge
    /// to one entry (the existing id is returned, touched).
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Store`] when the recall write fails.
    pub async fn remember(
        &self,
        principal: PrincipalId,
        content: &str,
        options: RememberOptions,
    ) -> MemoryResult<MemoryId> {
        let hash = content_hash(content);
        let window = chrono::Duration::seconds(
            i64::try_from(self.inner.config.dedup_window_secs).unwrap_or(300),
        );
        let since = Utc::now().checked_sub_signed(window).unwrap_or_else(Utc::now);

        if let Ok(Some(mut existing)) = self
            .inner
            .relational
            .find_by_hash(principal, &hash, since)
            .await
        {
            existing.touch();
            let lock = self.entry_lock(existing.id).await;
            let _guard = lock.lock().await;
            self.inner.relational.upsert_entry(&existing).await?;
            debug!(id = %existing.id, "Duplicate save within dedup window, converged");
            return Ok(existing.id);
        }

        let extraction = self.extract(principal, content).await;
        let mut tags = extraction.tags;
        for tag in options.tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let mut entry = MemoryEntry::new(principal, content)
            .with_entities(extraction.entities)
            .with_tags(tags)
            .with_priority(options.priority);
        if let Some(session) = options.source_session {
            entry = entry.with_source(session);
        }

        {
            let lock = self.entry_lock(entry.id).await;
            let _guard = lock.lock().await;
            self.inner.relational.upsert_entry(&entry).await?;
        }
        self.inner.tracker.mark_pending(entry.id);
        // Archival derivation never holds the recall write lock.
        if self
            .inner
            .job_tx
            .send(DerivationJob { entry: entry.clone(), attempt: 0 })
            .await
            .is_err()
        {
            warn!(id = %entry.id, "Derivation worker gone; entry stays recall-only");
            self.inner.tracker.mark_stalled(entry.id);
        }
        info!(id = %entry.id, "Memory saved");
        Ok(entry.id)
    }

    /// Hybrid search: BM25, vector, and graph legs in parallel, fused and
    /// re-scored. Never blocks on pending derivation; a leg whose store is
    /// down is skipped.
    ///
    /// # Errors
    ///
    /// Fails only when every leg is unavailable *and* the recall tier
    /// cannot be read at all.
    pub async fn search(
        &self,
        principal: PrincipalId,
        query: &str,
        k: usize,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        let inner = &self.inner;
        let terms = query_terms(query);
        let entities: Vec<String> = extract_heuristic(query).entities;

        let bm25_leg = async {
            match inner
                .relational
                .text_candidates(principal, &terms, inner.config.candidate_limit)
                .await
            {
                Ok(candidates) => {
                    let docs: Vec<(MemoryId, String)> =
                        candidates.iter().map(|e| (e.id, e.content.clone())).collect();
                    bm25_scores(&terms, &docs)
                },
                Err(e) => {
                    warn!(error = %e, "BM25 leg unavailable");
                    Vec::new()
                },
            }
        };

        let vector_leg = async {
            let embedded = inner
                .router
                .embed(principal, std::slice::from_ref(&query.to_string()))
                .await;
            match embedded {
                Ok(vectors) if !vectors.is_empty() => {
                    match inner.vector.search(principal, &vectors[0], k.max(8)).await {
                        Ok(points) => points.into_iter().map(|p| (p.id, p.score)).collect(),
                        Err(e) => {
                            warn!(error = %e, "Vector leg unavailable");
                            Vec::new()
                        },
                    }
                },
                Ok(_) => Vec::new(),
                Err(e) => {
                    debug!(error = %e, "No embedding for query");
                    Vec::new()
                },
            }
        };

        let graph_leg = async {
            if entities.is_empty() {
                return Vec::new();
            }
            match inner
                .graph
                .traverse(&entities, inner.config.graph_hops, inner.config.candidate_limit)
                .await
            {
                Ok(edges) => {
                    let mut seen: Vec<(MemoryId, f32)> = Vec::new();
                    for (idx, edge) in edges.iter().enumerate() {
                        if !seen.iter().any(|(id, _)| *id == edge.source_memory_id) {
                            #[allow(clippy::cast_precision_loss)]
                            let proximity = 1.0 / (1.0 + idx as f32);
                            seen.push((edge.source_memory_id, proximity));
                        }
                    }
                    seen
                },
                Err(e) => {
                    warn!(error = %e, "Graph leg unavailable");
                    Vec::new()
                },
            }
        };

        let (bm25, vector, graph) = tokio::join!(bm25_leg, vector_leg, graph_leg);

        let weights = (
            inner.config.ranker.vector,
            inner.config.ranker.bm25,
            inner.config.ranker.graph,
        );
        let hits = fuse(&vector, &bm25, &graph, weights, k);

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(entry) = self.materialize(hit.id).await? {
                // Principal isolation holds even for payload-reconstructed
                // entries.
                if entry.principal_id == principal {
                    results.push(self.touch_entry(entry).await?);
                }
            }
        }
        Ok(results)
    }

    /// Fetch an entry from recall, falling back to the vector payload for
    /// demoted entries.
    async fn materialize(&self, id: MemoryId) -> MemoryResult<Option<MemoryEntry>> {
        if let Some(entry) = self.inner.relational.get_entry(id).await? {
            return Ok(Some(entry));
        }
        match self.inner.vector.get_payload(id).await {
            Ok(Some(payload)) => Ok(serde_json::from_value::<MemoryEntry>(payload).ok()),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, "Payload fetch failed");
                Ok(None)
            },
        }
    }

    /// Touch an entry and mirror it back into recall when it crossed the
    /// promote threshold.
    async fn touch_entry(&self, mut entry: MemoryEntry) -> MemoryResult<MemoryEntry> {
        entry.touch();
        let in_recall = entry.tier == MemoryTier::Recall;
        let promote = !in_recall && entry.access_count >= self.inner.config.promote_threshold;

        if promote {
            entry.tier = MemoryTier::Recall;
            info!(id = %entry.id, count = entry.access_count, "Promoting entry back to recall");
        }
        if in_recall || promote {
            let lock = self.entry_lock(entry.id).await;
            let _guard = lock.lock().await;
            self.inner.relational.upsert_entry(&entry).await?;
        } else {
            // Archival-only: persist the access stats in the payload.
            if let Ok(payload) = serde_json::to_value(&entry)
                && let Some(vector) = entry.embedding.clone()
            {
                let _ = self
                    .inner
                    .vector
                    .upsert_vector(entry.id, entry.principal_id, &vector, payload)
                    .await;
            }
        }
        Ok(entry)
    }

    /// Confirmatory search for a forget request.
    ///
    /// # Errors
    ///
    /// Same surface as [`search`](Self::search).
    pub async fn forget_candidates(
        &self,
        principal: PrincipalId,
        query: &str,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        self.search(principal, query, 5).await
    }

    /// Delete an entry from every tier, in fixed order: recall, archival
    /// vector, archival graph. Idempotent; a second call after a partial
    /// failure completes the remaining deletions.
    ///
    /// # Errors
    ///
    /// Returns the first store failure; already-deleted tiers stay deleted.
    pub async fn forget(&self, id: MemoryId) -> MemoryResult<()> {
        let lock = self.entry_lock(id).await;
        let _guard = lock.lock().await;

        self.inner.relational.delete_entry(id).await?;
        self.inner.vector.delete_vector(id).await?;
        self.inner.graph.delete_by_source(id).await?;
        self.inner.tracker.clear(id);
        info!(id = %id, "Memory forgotten from all tiers");
        Ok(())
    }

    /// Compress a block of raw turns into one summary turn, saving the
    /// raw content to recall. Called by the scheduler at soft pressure.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Store`] when the recall writes fail. A
    /// summarization-model failure falls back to a mechanical digest.
    pub async fn compress_turns(
        &self,
        principal: PrincipalId,
        session: &SessionKey,
        turns: &[Turn],
    ) -> MemoryResult<Turn> {
        let Some(first) = turns.first() else {
            return Ok(Turn::system("(empty compression block)"));
        };
        let last = turns.last().unwrap_or(first);
        let span = (first.ts, last.ts);

        let block: String = turns
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n");

        // Raw turns move to recall-only residency.
        let entries: Vec<MemoryEntry> = turns
            .iter()
            .map(|t| {
                MemoryEntry::new(principal, format!("{}: {}", t.role, t.content))
                    .with_tags(vec!["transcript".to_string()])
                    .with_source(session.clone())
            })
            .collect();
        self.inner.relational.upsert_batch(&entries).await?;

        let request = ChatRequest::new(
            "Summarize this conversation block in a compact paragraph. Keep names, \
             numbers, and decisions.",
            vec![Message::user(&block)],
        )
        .max_tokens(300);
        let summary_text = match self
            .inner
            .router
            .complete(ModelRole::Utility, principal, &request)
            .await
        {
            Ok(response) => response.text,
            Err(e) => {
                warn!(error = %e, "Summarization failed, using mechanical digest");
                format!(
                    "[compressed {} turns; first: {}]",
                    turns.len(),
                    first.content.chars().take(120).collect::<String>()
                )
            },
        };

        info!(session = %session, turns = turns.len(), "Turn block compressed");
        Ok(Turn::system(summary_text).as_summary(span))
    }

    /// Demote stale recall entries to archival-only residency. Entries are
    /// only demoted once their derivation confirmed a payload in the
    /// vector tier; critical entries never move.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Store`] if the LRU scan fails.
    pub async fn demote_stale(&self, principal: PrincipalId) -> MemoryResult<usize> {
        let candidates = self
            .inner
            .relational
            .lru_entries(principal, self.inner.config.demote_batch)
            .await?;

        let mut demoted = 0usize;
        for mut entry in candidates {
            if entry.priority == Priority::Critical || entry.tier != MemoryTier::Recall {
                continue;
            }
            // Derivation must have converged before the recall copy goes.
            let payload_present = matches!(
                self.inner.vector.get_payload(entry.id).await,
                Ok(Some(_))
            );
            if !payload_present {
                continue;
            }

            entry.tier = MemoryTier::Archival;
            let vector = match entry.embedding.clone() {
                Some(v) if !v.is_empty() => v,
                // Recall row predates the embedding mirror; read it back
                // from the stored payload.
                _ => match self.inner.vector.get_payload(entry.id).await {
                    Ok(Some(p)) => serde_json::from_value::<MemoryEntry>(p)
                        .ok()
                        .and_then(|e| e.embedding)
                        .unwrap_or_default(),
                    _ => Vec::new(),
                },
            };
            if vector.is_empty() {
                continue;
            }

            let lock = self.entry_lock(entry.id).await;
            let _guard = lock.lock().await;
            // Refresh the payload with the final access stats, then drop
            // the recall row.
            if let Ok(payload) = serde_json::to_value(&entry) {
                self.inner
                    .vector
                    .upsert_vector(entry.id, entry.principal_id, &vector, payload)
                    .await?;
            }
            self.inner.relational.delete_entry(entry.id).await?;
            demoted = demoted.saturating_add(1);
            debug!(id = %entry.id, "Entry demoted to archival");
        }
        Ok(demoted)
    }

    /// Re-enqueue every stalled derivation.
    pub async fn reconcile(&self) {
        for id in self.inner.tracker.stalled_ids() {
            if let Ok(Some(entry)) = self.inner.relational.get_entry(id).await {
                self.inner.tracker.mark_pending(id);
                let _ = self
                    .inner
                    .job_tx
                    .send(DerivationJob { entry, attempt: 0 })
                    .await;
            }
        }
    }

    /// Wait until no derivations are pending, or the timeout passes.
    /// Intended for tests and graceful shutdown.
    pub async fn flush_derivations(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.tracker.pending_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pending = self.inner.tracker.pending_count(),
                    "Derivation flush timed out"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Health of every tier plus derivation backlog.
    pub async fn health(&self) -> FabricHealth {
        FabricHealth {
            relational: self.inner.relational.health().await,
            graph: self.inner.graph.health().await,
            vector: self.inner.vector.health().await,
            pending_derivations: self.inner.tracker.pending_count(),
        }
    }

    /// Soft-pressure threshold from config.
    #[must_use]
    pub fn soft_pressure(&self) -> f32 {
        self.inner.config.soft_pressure
    }

    /// Hard-pressure threshold from config.
    #[must_use]
    pub fn hard_pressure(&self) -> f32 {
        self.inner.config.hard_pressure
    }
}

/// The background derivation loop: embed, write vector payload, derive
/// graph edges. Retries with backoff; stalls after the attempt budget.
async fn derivation_worker(inner: Arc<FabricInner>, mut rx: mpsc::Receiver<DerivationJob>) {
    while let Some(job) = rx.recv().await {
        let id = job.entry.id;
        match derive_one(&inner, &job.entry).await {
            Ok(()) => {
                inner.tracker.clear(id);
                debug!(id = %id, "Archival derivation converged");
            },
            Err(e) => {
                let attempt = job.attempt.saturating_add(1);
                if attempt >= inner.config.derivation_max_attempts {
                    warn!(id = %id, error = %e, "Derivation stalled after retries");
                    inner.tracker.mark_stalled(id);
                } else {
                    let backoff = Duration::from_millis(100u64.saturating_mul(2u64.saturating_pow(attempt)));
                    let tx = inner.job_tx.clone();
                    let entry = job.entry.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(backoff).await;
                        let _ = tx.send(DerivationJob { entry, attempt }).await;
                    });
                }
            },
        }
    }
}

async fn derive_one(inner: &Arc<FabricInner>, entry: &MemoryEntry) -> MemoryResult<()> {
    // Vector derivation.
    let vectors = inner
        .router
        .embed(entry.principal_id, std::slice::from_ref(&entry.content))
        .await?;
    let vector = vectors.into_iter().next().unwrap_or_default();

    let mut enriched = entry.clone();
    enriched.embedding = Some(vector.clone());
    let payload =
        serde_json::to_value(&enriched).map_err(|e| itak_store::StoreError::Decode(e.to_string()))?;
    inner
        .vector
        .upsert_vector(entry.id, entry.principal_id, &vector, payload)
        .await?;

    // Mirror the embedding into the recall row so later demotion does not
    // need to re-embed. The derivation path stays off the keyed recall
    // lock; a concurrent touch may win the write, which only costs an
    // access-count bump.
    inner.relational.upsert_entry(&enriched).await?;

    // Graph derivation: pair the first entity with each other entity.
    if let Some((head, rest)) = entry.entities.split_first() {
        for other in rest {
            let relation = itak_core::GraphRelation::new(
                head.clone(),
                "related_to",
                other.clone(),
                entry.id,
                0.6,
            );
            inner.graph.upsert_relation(&relation).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use itak_limits::{LimiterConfig, RateLimiter};
    use itak_llm::{ModelBinding, ScriptedProvider};
    use itak_store::{MemGraphStore, MemRelationalStore, MemVectorStore};

    fn router() -> ModelRouter {
        let provider = Arc::new(ScriptedProvider::new("scripted", vec![]));
        ModelRouter::builder()
            .provider(provider)
            .role(
                ModelRole::Utility,
                vec![ModelBinding::new("scripted", "utility").free_model()],
            )
            .role(
                ModelRole::Embedding,
                vec![ModelBinding::new("scripted", "embedder").free_model()],
            )
            .build(Arc::new(RateLimiter::new(LimiterConfig::default())))
    }

    fn fabric() -> (MemoryFabric, Arc<MemRelationalStore>, Arc<MemVectorStore>) {
        let relational = Arc::new(MemRelationalStore::new());
        let vector = Arc::new(MemVectorStore::new());
        let fabric = MemoryFabric::new(
            Arc::clone(&relational) as Arc<dyn RelationalStore>,
            Arc::new(MemGraphStore::new()),
            Arc::clone(&vector) as Arc<dyn VectorStore>,
            router(),
            MemoryConfig {
                model_extraction: false,
                ..MemoryConfig::default()
            },
            None,
        );
        (fabric, relational, vector)
    }

    #[tokio::test]
    async fn remember_then_search_finds_the_entry() {
        let (fabric, _, _) = fabric();
        let principal = PrincipalId::new();

        let id = fabric
            .remember(principal, "The VPS port is 48920", RememberOptions::default())
            .await
            .unwrap();
        fabric.flush_derivations(Duration::from_secs(2)).await;

        let hits = fabric
            .search(principal, "What port is the VPS on?", 5)
            .await
            .unwrap();
        assert!(hits.iter().any(|e| e.id == id));
        assert!(hits[0].content.contains("48920"));
    }

    #[tokio::test]
    async fn duplicate_saves_converge_to_one_entry() {
        let (fabric, relational, _) = fabric();
        let principal = PrincipalId::new();

        let first = fabric
            .remember(principal, "dedup me", RememberOptions::default())
            .await
            .unwrap();
        let second = fabric
            .remember(principal, "dedup me", RememberOptions::default())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(relational.count(principal).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn principal_isolation_holds() {
        let (fabric, _, _) = fabric();
        let alice = PrincipalId::new();
        let bob = PrincipalId::new();

        fabric
            .remember(alice, "alice's secret garden plan", RememberOptions::default())
            .await
            .unwrap();
        fabric.flush_derivations(Duration::from_secs(2)).await;

        let hits = fabric.search(bob, "secret garden plan", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn forget_is_idempotent_and_complete() {
        let (fabric, _, vector) = fabric();
        let principal = PrincipalId::new();

        let id = fabric
            .remember(principal, "forget this fact", RememberOptions::default())
            .await
            .unwrap();
        fabric.flush_derivations(Duration::from_secs(2)).await;
        assert!(vector.get_payload(id).await.unwrap().is_some());

        fabric.forget(id).await.unwrap();
        fabric.forget(id).await.unwrap();

        let hits = fabric.search(principal, "forget this fact", 5).await.unwrap();
        assert!(!hits.iter().any(|e| e.id == id));
        assert!(vector.get_payload(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn demoted_entries_remain_searchable_and_promote_back() {
        let (fabric, relational, _) = fabric();
        let principal = PrincipalId::new();

        let id = fabric
            .remember(principal, "archival candidate about gardening", RememberOptions::default())
            .await
            .unwrap();
        fabric.flush_derivations(Duration::from_secs(2)).await;

        let demoted = fabric.demote_stale(principal).await.unwrap();
        assert_eq!(demoted, 1);
        assert!(relational.get_entry(id).await.unwrap().is_none());

        // Still searchable via the vector payload.
        let hits = fabric
            .search(principal, "archival candidate gardening", 5)
            .await
            .unwrap();
        assert!(hits.iter().any(|e| e.id == id));

        // Repeated access mirrors it back into recall.
        for _ in 0..3 {
            fabric
                .search(principal, "archival candidate gardening", 5)
                .await
                .unwrap();
        }
        assert!(relational.get_entry(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn compress_turns_preserves_span_and_moves_raw_to_recall() {
        let (fabric, relational, _) = fabric();
        let principal = PrincipalId::new();
        let session = SessionKey::new("cli", itak_core::RoomType::Direct, "local");

        let turns = vec![
            Turn::user("we decided the port is 48920"),
            Turn::assistant("noted, the port is 48920"),
        ];
        let summary = fabric
            .compress_turns(principal, &session, &turns)
            .await
            .unwrap();
        assert!(summary.is_summary());
        assert_eq!(
            summary.summarized_span,
            Some((turns[0].ts, turns[1].ts))
        );
        assert_eq!(relational.count(principal).await.unwrap(), 2);
    }
}
