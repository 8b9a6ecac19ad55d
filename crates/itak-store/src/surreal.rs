//! `SurrealDB`-backed adapter implementations.
//!
//! One [`Database`] connection backs all four adapters. Every query is
//! parameterized through binds; entry content never reaches the query
//! string. Timestamps are mirrored into epoch-millisecond fields for
//! ordering and window filters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itak_core::{GraphRelation, MemoryEntry, MemoryId, PrincipalId, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use surrealdb::types::SerdeWrapper;
use tracing::debug;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::traits::{GraphStore, RelationalStore, ScoredPoint, StoreHealth, TaskStore, VectorStore};

fn q_err(e: surrealdb::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

async fn ping(db: &Database) -> StoreHealth {
    match db.client().query("RETURN 1").await {
        Ok(_) => StoreHealth::Available,
        Err(_) => StoreHealth::Unavailable,
    }
}

/// Relational adapter over the `memory` table.
#[derive(Debug, Clone)]
pub struct SurrealRelationalStore {
    db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRow {
    entry: MemoryEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct CountRow {
    count: usize,
}

impl SurrealRelationalStore {
    /// Create an adapter over the shared connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn record(entry: &MemoryEntry) -> StoreResult<serde_json::Value> {
        let body = serde_json::to_value(entry)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(serde_json::json!({
            "entry": body,
            "principal": entry.principal_id.to_string(),
            "hash": crate::content_hash(&entry.content),
            "content_lc": entry.content.to_lowercase(),
            "created_ms": entry.created_at.timestamp_millis(),
            "accessed_ms": entry.last_accessed.timestamp_millis(),
        }))
    }
}

#[async_trait]
impl RelationalStore for SurrealRelationalStore {
    async fn upsert_entry(&self, entry: &MemoryEntry) -> StoreResult<()> {
        let record = Self::record(entry)?;
        self.db
            .client()
            .query("UPSERT type::thing('memory', $id) CONTENT $record")
            .bind(("id", entry.id.to_string()))
            .bind(("record", record))
            .await
            .map_err(q_err)?;
        Ok(())
    }

    async fn upsert_batch(&self, entries: &[MemoryEntry]) -> StoreResult<()> {
        // One transaction so a partial batch never lands.
        let mut query = self.db.client().query("BEGIN TRANSACTION");
        for (n, entry) in entries.iter().enumerate() {
            let record = Self::record(entry)?;
            query = query
                .query(format!(
                    "UPSERT type::thing('memory', $id_{n}) CONTENT $record_{n}"
                ))
                .bind((format!("id_{n}"), entry.id.to_string()))
                .bind((format!("record_{n}"), record));
        }
        query.query("COMMIT TRANSACTION").await.map_err(q_err)?;
        Ok(())
    }

    async fn get_entry(&self, id: MemoryId) -> StoreResult<Option<MemoryEntry>> {
        let mut response = self
            .db
            .client()
            .query("SELECT entry FROM type::thing('memory', $id)")
            .bind(("id", id.to_string()))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<EntryRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<EntryRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(rows.into_iter().next().map(|r| r.entry))
    }

    async fn delete_entry(&self, id: MemoryId) -> StoreResult<bool> {
        let mut response = self
            .db
            .client()
            .query("DELETE type::thing('memory', $id) RETURN BEFORE")
            .bind(("id", id.to_string()))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<EntryRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<EntryRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(!rows.is_empty())
    }

    async fn text_candidates(
        &self,
        principal: PrincipalId,
        terms: &[String],
        limit: usize,
    ) -> StoreResult<Vec<MemoryEntry>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        // Structure is code-built; every term value goes through a bind.
        let clauses: Vec<String> = (0..terms.len())
            .map(|n| format!("string::contains(content_lc, $term_{n})"))
            .collect();
        let sql = format!(
            "SELECT entry FROM memory WHERE principal = $principal AND ({}) ORDER BY accessed_ms DESC LIMIT $limit",
            clauses.join(" OR ")
        );
        let mut query = self
            .db
            .client()
            .query(sql)
            .bind(("principal", principal.to_string()))
            .bind(("limit", limit));
        for (n, term) in terms.iter().enumerate() {
            query = query.bind((format!("term_{n}"), term.to_lowercase()));
        }
        let mut response = query.await.map_err(q_err)?;
        let rows: Vec<SerdeWrapper<EntryRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<EntryRow> = rows.into_iter().map(|w| w.0).collect();
        debug!(terms = terms.len(), hits = rows.len(), "Text candidate scan");
        Ok(rows.into_iter().map(|r| r.entry).collect())
    }

    async fn find_by_hash(
        &self,
        principal: PrincipalId,
        hash: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<MemoryEntry>> {
        let mut response = self
            .db
            .client()
            .query(
                "SELECT entry FROM memory WHERE principal = $principal AND hash = $hash \
                 AND created_ms >= $since ORDER BY created_ms DESC LIMIT 1",
            )
            .bind(("principal", principal.to_string()))
            .bind(("hash", hash.to_string()))
            .bind(("since", since.timestamp_millis()))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<EntryRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<EntryRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(rows.into_iter().next().map(|r| r.entry))
    }

    async fn lru_entries(
        &self,
        principal: PrincipalId,
        limit: usize,
    ) -> StoreResult<Vec<MemoryEntry>> {
        let mut response = self
            .db
            .client()
            .query(
                "SELECT entry FROM memory WHERE principal = $principal \
                 ORDER BY accessed_ms ASC LIMIT $limit",
            )
            .bind(("principal", principal.to_string()))
            .bind(("limit", limit))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<EntryRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<EntryRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(rows.into_iter().map(|r| r.entry).collect())
    }

    async fn count(&self, principal: PrincipalId) -> StoreResult<usize> {
        let mut response = self
            .db
            .client()
            .query("SELECT count() AS count FROM memory WHERE principal = $principal GROUP ALL")
            .bind(("principal", principal.to_string()))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<CountRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<CountRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(rows.into_iter().next().map_or(0, |r| r.count))
    }

    async fn health(&self) -> StoreHealth {
        ping(&self.db).await
    }
}

/// Graph adapter over the `relation` table.
#[derive(Debug, Clone)]
pub struct SurrealGraphStore {
    db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelationRow {
    relation: GraphRelation,
}

impl SurrealGraphStore {
    /// Create an adapter over the shared connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn triple_id(relation: &GraphRelation) -> String {
        let (s, p, o) = relation.triple_key();
        crate::content_hash(&format!("{s}\u{1f}{p}\u{1f}{o}"))
    }
}

#[async_trait]
impl GraphStore for SurrealGraphStore {
    async fn upsert_relation(&self, relation: &GraphRelation) -> StoreResult<()> {
        let body = serde_json::to_value(relation)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let record = serde_json::json!({
            "relation": body,
            "subject": relation.subject_entity.to_lowercase(),
            "object": relation.object_entity.to_lowercase(),
            "source": relation.source_memory_id.to_string(),
        });
        self.db
            .client()
            .query("UPSERT type::thing('relation', $id) CONTENT $record")
            .bind(("id", Self::triple_id(relation)))
            .bind(("record", record))
            .await
            .map_err(q_err)?;
        Ok(())
    }

    async fn traverse(
        &self,
        entities: &[String],
        max_hops: u8,
        limit: usize,
    ) -> StoreResult<Vec<GraphRelation>> {
        let mut frontier: Vec<String> = entities.iter().map(|e| e.to_lowercase()).collect();
        let mut visited: std::collections::HashSet<String> = frontier.iter().cloned().collect();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut found = Vec::new();

        for _hop in 0..max_hops {
            if frontier.is_empty() {
                break;
            }
            let mut response = self
                .db
                .client()
                .query(
                    "SELECT relation FROM relation WHERE subject IN $frontier OR object IN $frontier",
                )
                .bind(("frontier", frontier.clone()))
                .await
                .map_err(q_err)?;
            let rows: Vec<SerdeWrapper<RelationRow>> = response.take(0).map_err(q_err)?;
            let rows: Vec<RelationRow> = rows.into_iter().map(|w| w.0).collect();

            let mut next = Vec::new();
            for row in rows {
                let relation = row.relation;
                let key = Self::triple_id(&relation);
                if seen.insert(key) {
                    for entity in [
                        relation.subject_entity.to_lowercase(),
                        relation.object_entity.to_lowercase(),
                    ] {
                        if visited.insert(entity.clone()) {
                            next.push(entity);
                        }
                    }
                    found.push(relation);
                    if found.len() >= limit {
                        return Ok(found);
                    }
                }
            }
            frontier = next;
        }
        Ok(found)
    }

    async fn delete_by_source(&self, source: MemoryId) -> StoreResult<usize> {
        let mut response = self
            .db
            .client()
            .query("DELETE relation WHERE source = $source RETURN BEFORE")
            .bind(("source", source.to_string()))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<RelationRow>> = response.take(0).map_err(q_err)?;
            let rows: Vec<RelationRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(rows.len())
    }

    async fn health(&self) -> StoreHealth {
        ping(&self.db).await
    }
}

/// Vector adapter over the `vector_point` table.
#[derive(Debug, Clone)]
pub struct SurrealVectorStore {
    db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScoreRow {
    entry_id: String,
    score: f32,
}

impl SurrealVectorStore {
    /// Create an adapter over the shared connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    async fn upsert_vector(
        &self,
        id: MemoryId,
        principal: PrincipalId,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        self.db
            .client()
            .query(
                "UPSERT type::thing('vector_point', $id) CONTENT \
                 { entry_id: $id, principal: $principal, embedding: $embedding, payload: $payload }",
            )
            .bind(("id", id.to_string()))
            .bind(("principal", principal.to_string()))
            .bind(("embedding", vector.to_vec()))
            .bind(("payload", payload))
            .await
            .map_err(q_err)?;
        Ok(())
    }

    async fn get_payload(&self, id: MemoryId) -> StoreResult<Option<serde_json::Value>> {
        #[derive(Debug, Serialize, Deserialize)]
        struct PayloadRow {
            payload: serde_json::Value,
        }
        let mut response = self
            .db
            .client()
            .query("SELECT payload FROM type::thing('vector_point', $id)")
            .bind(("id", id.to_string()))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<PayloadRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<PayloadRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(rows.into_iter().next().map(|r| r.payload))
    }

    async fn search(
        &self,
        principal: PrincipalId,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<ScoredPoint>> {
        let mut response = self
            .db
            .client()
            .query(
                "SELECT entry_id, vector::similarity::cosine(embedding, $query) AS score \
                 FROM vector_point WHERE principal = $principal ORDER BY score DESC LIMIT $k",
            )
            .bind(("query", query.to_vec()))
            .bind(("principal", principal.to_string()))
            .bind(("k", k))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<ScoreRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<ScoreRow> = rows.into_iter().map(|w| w.0).collect();
        rows.into_iter()
            .map(|row| {
                let id = row
                    .entry_id
                    .parse()
                    .map_err(|e: uuid::Error| StoreError::Decode(e.to_string()))?;
                Ok(ScoredPoint {
                    id: MemoryId(id),
                    score: row.score,
                })
            })
            .collect()
    }

    async fn delete_vector(&self, id: MemoryId) -> StoreResult<bool> {
        let mut response = self
            .db
            .client()
            .query("DELETE type::thing('vector_point', $id) RETURN BEFORE")
            .bind(("id", id.to_string()))
            .await
            .map_err(q_err)?;
        let rows: Vec<serde_json::Value> = response.take(0).map_err(q_err)?;
        Ok(!rows.is_empty())
    }

    async fn health(&self) -> StoreHealth {
        ping(&self.db).await
    }
}

/// Task adapter over the `task` table.
#[derive(Debug, Clone)]
pub struct SurrealTaskStore {
    db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskRow {
    task: Task,
}

impl SurrealTaskStore {
    /// Create an adapter over the shared connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskStore for SurrealTaskStore {
    async fn upsert_task(&self, task: &Task) -> StoreResult<()> {
        let body = serde_json::to_value(task)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let record = serde_json::json!({
            "task": body,
            "status": task.status.to_string(),
            "created_ms": task.created_at.timestamp_millis(),
        });
        self.db
            .client()
            .query("UPSERT type::thing('task', $id) CONTENT $record")
            .bind(("id", task.id.to_string()))
            .bind(("record", record))
            .await
            .map_err(q_err)?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let mut response = self
            .db
            .client()
            .query("SELECT task FROM type::thing('task', $id)")
            .bind(("id", id.to_string()))
            .await
            .map_err(q_err)?;
        let rows: Vec<SerdeWrapper<TaskRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<TaskRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(rows.into_iter().next().map(|r| r.task))
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>> {
        let mut response = match status {
            Some(status) => self
                .db
                .client()
                .query("SELECT task FROM task WHERE status = $status ORDER BY created_ms DESC")
                .bind(("status", status.to_string()))
                .await
                .map_err(q_err)?,
            None => self
                .db
                .client()
                .query("SELECT task FROM task ORDER BY created_ms DESC")
                .await
                .map_err(q_err)?,
        };
        let rows: Vec<SerdeWrapper<TaskRow>> = response.take(0).map_err(q_err)?;
        let rows: Vec<TaskRow> = rows.into_iter().map(|w| w.0).collect();
        Ok(rows.into_iter().map(|r| r.task).collect())
    }

    async fn health(&self) -> StoreHealth {
        ping(&self.db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relational_round_trip_on_memory_engine() {
        let db = Database::connect_memory().await.unwrap();
        let store = SurrealRelationalStore::new(db);
        let principal = PrincipalId::new();
        let entry = MemoryEntry::new(principal, "the VPS port is 48920");

        store.upsert_entry(&entry).await.unwrap();
        let got = store.get_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(got.content, entry.content);

        let hits = store
            .text_candidates(principal, &["vps".to_string()], 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        assert!(store.delete_entry(entry.id).await.unwrap());
        assert!(!store.delete_entry(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn vector_round_trip_on_memory_engine() {
        let db = Database::connect_memory().await.unwrap();
        let store = SurrealVectorStore::new(db);
        let principal = PrincipalId::new();
        let id = MemoryId::new();

        store
            .upsert_vector(id, principal, &[1.0, 0.0], serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let hits = store.search(principal, &[1.0, 0.0], 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!(store.delete_vector(id).await.unwrap());
    }
}
