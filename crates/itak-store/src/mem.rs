//! In-memory adapter implementations.
//!
//! Used by unit tests and by deployments that run without a database.
//! Each store carries a forcible health flag so degraded-mode behavior is
//! testable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itak_core::{GraphRelation, MemoryEntry, MemoryId, PrincipalId, Task, TaskId, TaskStatus};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::content_hash;
use crate::error::StoreResult;
use crate::traits::{
    GraphStore, RelationalStore, ScoredPoint, StoreHealth, TaskStore, VectorStore,
    cosine_similarity,
};

/// Forcible health flag shared by the in-memory stores.
#[derive(Debug, Default)]
struct HealthFlag(AtomicU8);

impl HealthFlag {
    fn get(&self) -> StoreHealth {
        match self.0.load(Ordering::Acquire) {
            1 => StoreHealth::Degraded,
            2 => StoreHealth::Unavailable,
            _ => StoreHealth::Available,
        }
    }

    fn set(&self, health: StoreHealth) {
        let value = match health {
            StoreHealth::Available => 0,
            StoreHealth::Degraded => 1,
            StoreHealth::Unavailable => 2,
        };
        self.0.store(value, Ordering::Release);
    }
}

/// In-memory relational store.
#[derive(Debug, Default)]
pub struct MemRelationalStore {
    entries: RwLock<HashMap<MemoryId, MemoryEntry>>,
    health: HealthFlag,
}

impl MemRelationalStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a health state (tests).
    pub fn set_health(&self, health: StoreHealth) {
        self.health.set(health);
    }

    fn guard(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<MemoryId, MemoryEntry>> {
        self.entries.write().expect("relational lock poisoned")
    }
}

#[async_trait]
impl RelationalStore for MemRelationalStore {
    async fn upsert_entry(&self, entry: &MemoryEntry) -> StoreResult<()> {
        self.guard().insert(entry.id, entry.clone());
        Ok(())
    }

    async fn upsert_batch(&self, entries: &[MemoryEntry]) -> StoreResult<()> {
        let mut map = self.guard();
        for entry in entries {
            map.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    async fn get_entry(&self, id: MemoryId) -> StoreResult<Option<MemoryEntry>> {
        Ok(self
            .entries
            .read()
            .expect("relational lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn delete_entry(&self, id: MemoryId) -> StoreResult<bool> {
        Ok(self.guard().remove(&id).is_some())
    }

    async fn text_candidates(
        &self,
        principal: PrincipalId,
        terms: &[String],
        limit: usize,
    ) -> StoreResult<Vec<MemoryEntry>> {
        let lowered: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let map = self.entries.read().expect("relational lock poisoned");
        let mut hits: Vec<MemoryEntry> = map
            .values()
            .filter(|e| e.principal_id == principal)
            .filter(|e| {
                let content = e.content.to_lowercase();
                lowered.iter().any(|t| content.contains(t))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn find_by_hash(
        &self,
        principal: PrincipalId,
        hash: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<MemoryEntry>> {
        let map = self.entries.read().expect("relational lock poisoned");
        Ok(map
            .values()
            .filter(|e| e.principal_id == principal && e.created_at >= since)
            .filter(|e| content_hash(&e.content) == hash)
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn lru_entries(
        &self,
        principal: PrincipalId,
        limit: usize,
    ) -> StoreResult<Vec<MemoryEntry>> {
        let map = self.entries.read().expect("relational lock poisoned");
        let mut entries: Vec<MemoryEntry> = map
            .values()
            .filter(|e| e.principal_id == principal)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn count(&self, principal: PrincipalId) -> StoreResult<usize> {
        let map = self.entries.read().expect("relational lock poisoned");
        Ok(map.values().filter(|e| e.principal_id == principal).count())
    }

    async fn health(&self) -> StoreHealth {
        self.health.get()
    }
}

/// In-memory graph store.
#[derive(Debug, Default)]
pub struct MemGraphStore {
    relations: RwLock<HashMap<(String, String, String), GraphRelation>>,
    health: HealthFlag,
}

impl MemGraphStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a health state (tests).
    pub fn set_health(&self, health: StoreHealth) {
        self.health.set(health);
    }
}

#[async_trait]
impl GraphStore for MemGraphStore {
    async fn upsert_relation(&self, relation: &GraphRelation) -> StoreResult<()> {
        let key = (
            relation.subject_entity.clone(),
            relation.predicate.clone(),
            relation.object_entity.clone(),
        );
        self.relations
            .write()
            .expect("graph lock poisoned")
            .insert(key, relation.clone());
        Ok(())
    }

    async fn traverse(
        &self,
        entities: &[String],
        max_hops: u8,
        limit: usize,
    ) -> StoreResult<Vec<GraphRelation>> {
        let map = self.relations.read().expect("graph lock poisoned");
        let mut frontier: HashSet<String> = entities.iter().map(|e| e.to_lowercase()).collect();
        let mut visited = frontier.clone();
        let mut found: Vec<GraphRelation> = Vec::new();
        let mut seen_edges: HashSet<(String, String, String)> = HashSet::new();

        for _hop in 0..max_hops {
            let mut next: HashSet<String> = HashSet::new();
            for relation in map.values() {
                let subject = relation.subject_entity.to_lowercase();
                let object = relation.object_entity.to_lowercase();
                let touches = frontier.contains(&subject) || frontier.contains(&object);
                if !touches {
                    continue;
                }
                let key = (
                    relation.subject_entity.clone(),
                    relation.predicate.clone(),
                    relation.object_entity.clone(),
                );
                if seen_edges.insert(key) {
                    found.push(relation.clone());
                    if found.len() >= limit {
                        return Ok(found);
                    }
                }
                if !visited.contains(&subject) {
                    next.insert(subject.clone());
                }
                if !visited.contains(&object) {
                    next.insert(object.clone());
                }
            }
            if next.is_empty() {
                break;
            }
            visited.extend(next.iter().cloned());
            frontier = next;
        }
        Ok(found)
    }

    async fn delete_by_source(&self, source: MemoryId) -> StoreResult<usize> {
        let mut map = self.relations.write().expect("graph lock poisoned");
        let before = map.len();
        map.retain(|_, r| r.source_memory_id != source);
        Ok(before.saturating_sub(map.len()))
    }

    async fn health(&self) -> StoreHealth {
        self.health.get()
    }
}

/// In-memory vector store.
#[derive(Debug, Default)]
pub struct MemVectorStore {
    vectors: RwLock<HashMap<MemoryId, (PrincipalId, Vec<f32>, serde_json::Value)>>,
    health: HealthFlag,
}

impl MemVectorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a health state (tests).
    pub fn set_health(&self, health: StoreHealth) {
        self.health.set(health);
    }
}

#[async_trait]
impl VectorStore for MemVectorStore {
    async fn upsert_vector(
        &self,
        id: MemoryId,
        principal: PrincipalId,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        self.vectors
            .write()
            .expect("vector lock poisoned")
            .insert(id, (principal, vector.to_vec(), payload));
        Ok(())
    }

    async fn search(
        &self,
        principal: PrincipalId,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<ScoredPoint>> {
        let map = self.vectors.read().expect("vector lock poisoned");
        let mut scored: Vec<ScoredPoint> = map
            .iter()
            .filter(|(_, (owner, _, _))| *owner == principal)
            .map(|(id, (_, vector, _))| ScoredPoint {
                id: *id,
                score: cosine_similarity(query, vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn get_payload(&self, id: MemoryId) -> StoreResult<Option<serde_json::Value>> {
        let map = self.vectors.read().expect("vector lock poisoned");
        Ok(map.get(&id).map(|(_, _, payload)| payload.clone()))
    }

    async fn delete_vector(&self, id: MemoryId) -> StoreResult<bool> {
        Ok(self
            .vectors
            .write()
            .expect("vector lock poisoned")
            .remove(&id)
            .is_some())
    }

    async fn health(&self) -> StoreHealth {
        self.health.get()
    }
}

/// In-memory task store.
#[derive(Debug, Default)]
pub struct MemTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    health: HealthFlag,
}

impl MemTaskStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn upsert_task(&self, task: &Task) -> StoreResult<()> {
        self.tasks
            .write()
            .expect("task lock poisoned")
            .insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self
            .tasks
            .read()
            .expect("task lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>> {
        let map = self.tasks.read().expect("task lock poisoned");
        let mut tasks: Vec<Task> = map
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn health(&self) -> StoreHealth {
        self.health.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(principal: PrincipalId, content: &str) -> MemoryEntry {
        MemoryEntry::new(principal, content)
    }

    #[tokio::test]
    async fn relational_crud_and_candidates() {
        let store = MemRelationalStore::new();
        let principal = PrincipalId::new();
        let e = entry(principal, "the VPS port is 48920");
        store.upsert_entry(&e).await.unwrap();

        let got = store.get_entry(e.id).await.unwrap().unwrap();
        assert_eq!(got.content, e.content);

        let hits = store
            .text_candidates(principal, &["vps".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        // Another principal sees nothing.
        let other = store
            .text_candidates(PrincipalId::new(), &["vps".to_string()], 10)
            .await
            .unwrap();
        assert!(other.is_empty());

        assert!(store.delete_entry(e.id).await.unwrap());
        assert!(!store.delete_entry(e.id).await.unwrap());
    }

    #[tokio::test]
    async fn hash_lookup_respects_window() {
        let store = MemRelationalStore::new();
        let principal = PrincipalId::new();
        let e = entry(principal, "dedup me");
        store.upsert_entry(&e).await.unwrap();

        let hash = content_hash("dedup me");
        let found = store
            .find_by_hash(principal, &hash, Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, e.id);

        let outside = store
            .find_by_hash(principal, &hash, Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(outside.is_none());
    }

    #[tokio::test]
    async fn graph_traversal_is_hop_bounded() {
        let store = MemGraphStore::new();
        let source = MemoryId::new();
        store
            .upsert_relation(&GraphRelation::new("a", "links", "b", source, 0.9))
            .await
            .unwrap();
        store
            .upsert_relation(&GraphRelation::new("b", "links", "c", source, 0.9))
            .await
            .unwrap();
        store
            .upsert_relation(&GraphRelation::new("c", "links", "d", source, 0.9))
            .await
            .unwrap();

        let one_hop = store.traverse(&["a".to_string()], 1, 10).await.unwrap();
        assert_eq!(one_hop.len(), 1);

        let two_hops = store.traverse(&["a".to_string()], 2, 10).await.unwrap();
        assert_eq!(two_hops.len(), 2);
    }

    #[tokio::test]
    async fn graph_upsert_is_most_recent_wins() {
        let store = MemGraphStore::new();
        let first = GraphRelation::new("vps", "listens_on", "48920", MemoryId::new(), 0.5);
        let second = GraphRelation::new("vps", "listens_on", "48920", MemoryId::new(), 0.9);
        store.upsert_relation(&first).await.unwrap();
        store.upsert_relation(&second).await.unwrap();

        let edges = store.traverse(&["vps".to_string()], 1, 10).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].confidence - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn vector_search_ranks_by_cosine() {
        let store = MemVectorStore::new();
        let principal = PrincipalId::new();
        let near = MemoryId::new();
        let far = MemoryId::new();
        store
            .upsert_vector(near, principal, &[1.0, 0.0, 0.0], serde_json::Value::Null)
            .await
            .unwrap();
        store
            .upsert_vector(far, principal, &[0.0, 1.0, 0.0], serde_json::Value::Null)
            .await
            .unwrap();

        let hits = store.search(principal, &[0.9, 0.1, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].id, near);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn delete_by_source_is_idempotent() {
        let store = MemGraphStore::new();
        let source = MemoryId::new();
        store
            .upsert_relation(&GraphRelation::new("x", "is", "y", source, 1.0))
            .await
            .unwrap();
        assert_eq!(store.delete_by_source(source).await.unwrap(), 1);
        assert_eq!(store.delete_by_source(source).await.unwrap(), 0);
    }
}
