//! Asynchronous archival derivation.
//!
//! A save returns once the recall row lands; embedding and graph edges
//! are derived by a background worker. Failures are retried with backoff;
//! an entry that keeps failing stays flagged `DerivationPending` and is
//! re-run by [`reconcile`](crate::MemoryFabric::reconcile). Reads never
//! wait on any of this.

use dashmap::DashMap;
use itak_core::{MemoryEntry, MemoryId};
use serde::Serialize;

/// Observability view of one entry's derivation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationStatus {
    /// Queued or retrying.
    Pending,
    /// Exhausted its attempts; waiting for reconcile.
    Stalled,
}

/// One derivation unit of work.
#[derive(Debug, Clone)]
pub(crate) struct DerivationJob {
    pub(crate) entry: MemoryEntry,
    pub(crate) attempt: u32,
}

/// Tracks entries whose archival derivation has not yet converged.
#[derive(Debug, Default)]
pub(crate) struct DerivationTracker {
    states: DashMap<MemoryId, DerivationStatus>,
}

impl DerivationTracker {
    pub(crate) fn mark_pending(&self, id: MemoryId) {
        self.states.insert(id, DerivationStatus::Pending);
    }

    pub(crate) fn mark_stalled(&self, id: MemoryId) {
        self.states.insert(id, DerivationStatus::Stalled);
    }

    pub(crate) fn clear(&self, id: MemoryId) {
        self.states.remove(&id);
    }

    /// Entries currently pending or stalled.
    pub(crate) fn pending_count(&self) -> usize {
        self.states.len()
    }

    /// Ids that stalled out and need a reconcile pass.
    pub(crate) fn stalled_ids(&self) -> Vec<MemoryId> {
        self.states
            .iter()
            .filter(|e| *e.value() == DerivationStatus::Stalled)
            .map(|e| *e.key())
            .collect()
    }
}
