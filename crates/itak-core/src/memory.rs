//! Memory entries, tiers, and graph relations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::principal::PrincipalId;
use crate::session::SessionKey;

/// Unique identifier for a logical memory entry. The same id is shared by
/// the entry's recall row, vector point, and derived graph edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Residency tier of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Filesystem markdown, always in prompt assembly.
    Core,
    /// Relational store, paged by pressure.
    Recall,
    /// Graph + vector stores, searched on miss.
    Archival,
    /// On-demand file/URL retrieval, chunked on demand.
    External,
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core => write!(f, "core"),
            Self::Recall => write!(f, "recall"),
            Self::Archival => write!(f, "archival"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Retention priority. `Critical` entries are never demoted under pressure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Default retention.
    #[default]
    Normal,
    /// Demoted last.
    High,
    /// Never demoted.
    Critical,
}

/// A stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Logical id, stable across tiers and demotions.
    pub id: MemoryId,
    /// Owning principal. Search never crosses principals.
    pub principal_id: PrincipalId,
    /// Current authoritative tier.
    pub tier: MemoryTier,
    /// Entry text.
    pub content: String,
    /// Extracted entity names.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Retention priority.
    #[serde(default)]
    pub priority: Priority,
    /// Session the entry was saved from, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session: Option<SessionKey>,
    /// Embedding vector, present once archival derivation ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Updated on every retrieval.
    pub last_accessed: DateTime<Utc>,
    /// Incremented on every retrieval.
    #[serde(default)]
    pub access_count: u64,
}

impl MemoryEntry {
    /// Create a new recall-tier entry.
    #[must_use]
    pub fn new(principal_id: PrincipalId, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MemoryId::new(),
            principal_id,
            tier: MemoryTier::Recall,
            content: content.into(),
            entities: Vec::new(),
            tags: Vec::new(),
            priority: Priority::Normal,
            source_session: None,
            embedding: None,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }

    /// Set extracted entities.
    #[must_use]
    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }

    /// Set tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the originating session.
    #[must_use]
    pub fn with_source(mut self, session: SessionKey) -> Self {
        self.source_session = Some(session);
        self
    }

    /// Record a retrieval: bump `access_count`, refresh `last_accessed`.
    pub fn touch(&mut self) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = Utc::now();
    }
}

/// A typed edge in the archival graph.
///
/// `(subject, predicate, object)` is unique; re-insertion replaces the
/// existing edge (most-recent-wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelation {
    /// Subject entity name.
    pub subject_entity: String,
    /// Relation predicate.
    pub predicate: String,
    /// Object entity name.
    pub object_entity: String,
    /// The memory this edge was derived from.
    pub source_memory_id: MemoryId,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl GraphRelation {
    /// Create a new relation derived from `source`.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        source: MemoryId,
        confidence: f32,
    ) -> Self {
        Self {
            subject_entity: subject.into(),
            predicate: predicate.into(),
            object_entity: object.into(),
            source_memory_id: source,
            confidence: confidence.clamp(0.0, 1.0),
            created_at: Utc::now(),
        }
    }

    /// The uniqueness key for upserts.
    #[must_use]
    pub fn triple_key(&self) -> (&str, &str, &str) {
        (
            &self.subject_entity,
            &self.predicate,
            &self.object_entity,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_updates_access_stats() {
        let mut e = MemoryEntry::new(PrincipalId::new(), "the VPS port is 48920");
        let before = e.last_accessed;
        e.touch();
        assert_eq!(e.access_count, 1);
        assert!(e.last_accessed >= before);
    }

    #[test]
    fn confidence_is_clamped() {
        let r = GraphRelation::new("vps", "listens_on", "48920", MemoryId::new(), 3.0);
        assert!((r.confidence - 1.0).abs() < f32::EPSILON);
    }
}
