//! The three store contracts plus the task store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itak_core::{GraphRelation, MemoryEntry, MemoryId, PrincipalId, Task, TaskId, TaskStatus};

use crate::error::StoreResult;

/// Adapter health, polled by the fabric and surfaced by `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreHealth {
    /// Fully operational.
    Available,
    /// Serving, but recent operations failed.
    Degraded,
    /// Not serving.
    Unavailable,
}

impl std::fmt::Display for StoreHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Keyed CRUD over memory entries. Backs the recall tier.
///
/// Implementations must use parameterized queries exclusively; entry
/// content is attacker-influenced text.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert or replace an entry by id.
    async fn upsert_entry(&self, entry: &MemoryEntry) -> StoreResult<()>;

    /// Insert or replace a batch of entries in one transaction.
    async fn upsert_batch(&self, entries: &[MemoryEntry]) -> StoreResult<()>;

    /// Fetch an entry by id.
    async fn get_entry(&self, id: MemoryId) -> StoreResult<Option<MemoryEntry>>;

    /// Delete an entry by id. Returns whether it existed.
    async fn delete_entry(&self, id: MemoryId) -> StoreResult<bool>;

    /// Entries owned by `principal` whose content matches any of `terms`.
    /// Scoring happens in the fabric, not here.
    async fn text_candidates(
        &self,
        principal: PrincipalId,
        terms: &[String],
        limit: usize,
    ) -> StoreResult<Vec<MemoryEntry>>;

    /// The most recent entry with this content hash saved after `since`,
    /// if any. Drives the fabric's dedup window.
    async fn find_by_hash(
        &self,
        principal: PrincipalId,
        hash: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<MemoryEntry>>;

    /// Least-recently-accessed entries for `principal`, oldest first.
    /// Drives demotion under hard pressure.
    async fn lru_entries(
        &self,
        principal: PrincipalId,
        limit: usize,
    ) -> StoreResult<Vec<MemoryEntry>>;

    /// Total entry count for `principal`.
    async fn count(&self, principal: PrincipalId) -> StoreResult<usize>;

    /// Adapter health.
    async fn health(&self) -> StoreHealth;
}

/// Typed entity edges with bounded traversal. Backs the archival graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert an edge; `(subject, predicate, object)` is unique with
    /// most-recent-wins semantics.
    async fn upsert_relation(&self, relation: &GraphRelation) -> StoreResult<()>;

    /// Edges reachable from `entities` within `max_hops` hops.
    async fn traverse(
        &self,
        entities: &[String],
        max_hops: u8,
        limit: usize,
    ) -> StoreResult<Vec<GraphRelation>>;

    /// Delete all edges derived from `source`. Returns how many were
    /// removed. Idempotent.
    async fn delete_by_source(&self, source: MemoryId) -> StoreResult<usize>;

    /// Adapter health.
    async fn health(&self) -> StoreHealth;
}

/// One vector search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    /// The entry the vector belongs to.
    pub id: MemoryId,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Embedding storage with cosine top-k. Backs the archival vector tier.
///
/// The payload carries the full serialized entry so a demoted memory
/// (recall row dropped) remains reconstructable from this tier alone.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector and payload for an entry.
    async fn upsert_vector(
        &self,
        id: MemoryId,
        principal: PrincipalId,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> StoreResult<()>;

    /// Top-`k` nearest points for `principal` by cosine similarity.
    async fn search(
        &self,
        principal: PrincipalId,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<ScoredPoint>>;

    /// Fetch the stored payload for an entry, if present.
    async fn get_payload(&self, id: MemoryId) -> StoreResult<Option<serde_json::Value>>;

    /// Delete the vector for an entry. Returns whether it existed.
    /// Idempotent.
    async fn delete_vector(&self, id: MemoryId) -> StoreResult<bool>;

    /// Adapter health.
    async fn health(&self) -> StoreHealth;
}

/// Task persistence, used by the gateway and the scheduler.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a task.
    async fn upsert_task(&self, task: &Task) -> StoreResult<()>;

    /// Fetch a task by id.
    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>>;

    /// All tasks, optionally filtered by status, newest first.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>>;

    /// Adapter health.
    async fn health(&self) -> StoreHealth;
}

/// Cosine similarity between two vectors of equal dimension.
///
/// Returns 0.0 for mismatched or zero-magnitude inputs.
#[must_use]
#[allow(clippy::arithmetic_side_effects)]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.2f32, 0.4, 0.6];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
