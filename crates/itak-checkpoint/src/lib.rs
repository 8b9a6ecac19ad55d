//! Crash-safe working-context persistence.
//!
//! One checkpoint file per session, replaced atomically: write to a
//! temporary sibling, fsync, rename over the target. A checkpoint file is
//! therefore either absent or fully valid. Writes are debounced per
//! session and forced at step transitions and before long external calls.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use itak_core::{Classify, ErrorKind, SessionKey, ToolCall, Turn, WorkingContext};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Current checkpoint schema version. Files with any other version are
/// treated as absent.
pub const SCHEMA_VERSION: u32 = 1;

/// Checkpoint errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("checkpoint encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Classify for CheckpointError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InternalInvariant
    }
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// The durable mirror of one session's in-flight state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Owning session.
    pub session_key: SessionKey,
    /// The working context at save time.
    pub working_context: WorkingContext,
    /// A tool call that was dispatched but not yet observed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool: Option<ToolCall>,
    /// Recent transcript turns, newest last.
    #[serde(default)]
    pub history_tail: Vec<Turn>,
    /// Monologue iteration at save time.
    pub iteration: u32,
    /// Save time.
    pub saved_at: DateTime<Utc>,
    /// Schema version.
    pub schema_version: u32,
}

impl CheckpointRecord {
    /// Build a record for the current iteration.
    #[must_use]
    pub fn new(session_key: SessionKey, working_context: WorkingContext, iteration: u32) -> Self {
        Self {
            session_key,
            working_context,
            pending_tool: None,
            history_tail: Vec::new(),
            iteration,
            saved_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Attach the recent transcript tail.
    #[must_use]
    pub fn with_history_tail(mut self, tail: Vec<Turn>) -> Self {
        self.history_tail = tail;
        self
    }

    /// Attach a dispatched-but-unobserved tool call.
    #[must_use]
    pub fn with_pending_tool(mut self, call: ToolCall) -> Self {
        self.pending_tool = Some(call);
        self
    }
}

/// Atomic per-session checkpoint storage under `data/sessions/`.
#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    min_interval: Duration,
    last_write: DashMap<String, Instant>,
}

impl CheckpointStore {
    /// Create a store rooted at `root` with the given debounce interval.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, min_interval: Duration) -> Self {
        Self {
            root: root.into(),
            min_interval,
            last_write: DashMap::new(),
        }
    }

    /// Directory for a session, creating it lazily on write.
    #[must_use]
    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.as_path_segment())
    }

    fn checkpoint_path(&self, key: &SessionKey) -> PathBuf {
        self.session_dir(key).join("checkpoint")
    }

    /// Save a checkpoint, debounced. Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on serialization or filesystem failure.
    pub async fn checkpoint(&self, record: &CheckpointRecord) -> CheckpointResult<bool> {
        let key = record.session_key.to_string();
        if let Some(last) = self.last_write.get(&key)
            && last.elapsed() < self.min_interval
        {
            debug!(session = %key, "Checkpoint debounced");
            return Ok(false);
        }
        self.checkpoint_forced(record).await?;
        Ok(true)
    }

    /// Save a checkpoint unconditionally (step transitions, pre-dispatch).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on serialization or filesystem failure.
    pub async fn checkpoint_forced(&self, record: &CheckpointRecord) -> CheckpointResult<()> {
        let path = self.checkpoint_path(&record.session_key);
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        tokio::fs::create_dir_all(&dir).await?;

        let body = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &body).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &path).await?;

        self.last_write
            .insert(record.session_key.to_string(), Instant::now());
        debug!(session = %record.session_key, iteration = record.iteration, "Checkpoint written");
        Ok(())
    }

    /// Load the checkpoint for a session, if one exists and is valid.
    ///
    /// A schema-version mismatch is treated as absence and logged as a
    /// downgrade event. An unreadable file is also treated as absence:
    /// atomic replace means a torn file can only come from outside
    /// interference, and resuming fresh beats refusing to start.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] for filesystem failures other than
    /// absence.
    pub async fn resume(&self, key: &SessionKey) -> CheckpointResult<Option<CheckpointRecord>> {
        let path = self.checkpoint_path(key);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<CheckpointRecord>(&body) {
            Ok(record) if record.schema_version == SCHEMA_VERSION => {
                info!(session = %key, iteration = record.iteration, "Checkpoint resumed");
                Ok(Some(record))
            },
            Ok(record) => {
                warn!(
                    session = %key,
                    found = record.schema_version,
                    expected = SCHEMA_VERSION,
                    "Checkpoint schema mismatch, treating as absent"
                );
                Ok(None)
            },
            Err(e) => {
                warn!(session = %key, error = %e, "Checkpoint unreadable, treating as absent");
                Ok(None)
            },
        }
    }

    /// Remove a session's checkpoint. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] for filesystem failures other than
    /// absence.
    pub async fn remove(&self, key: &SessionKey) -> CheckpointResult<()> {
        match tokio::fs::remove_file(self.checkpoint_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Session keys that have a checkpoint on disk.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the root directory exists but
    /// cannot be read.
    pub async fn known_sessions(&self) -> CheckpointResult<Vec<SessionKey>> {
        let mut keys = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let checkpoint = entry.path().join("checkpoint");
            if !checkpoint.exists() {
                continue;
            }
            let body = tokio::fs::read(&checkpoint).await?;
            if let Ok(record) = serde_json::from_slice::<CheckpointRecord>(&body) {
                keys.push(record.session_key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itak_core::{RoomType, TaskId};

    fn record(key: &SessionKey, iteration: u32) -> CheckpointRecord {
        CheckpointRecord::new(key.clone(), WorkingContext::new(TaskId::new()), iteration)
    }

    fn store(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path(), Duration::ZERO)
    }

    #[tokio::test]
    async fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = SessionKey::new("discord", RoomType::Direct, "42");

        store.checkpoint_forced(&record(&key, 3)).await.unwrap();
        let resumed = store.resume(&key).await.unwrap().unwrap();
        assert_eq!(resumed.iteration, 3);
        assert_eq!(resumed.session_key, key);
    }

    #[tokio::test]
    async fn absent_checkpoint_resumes_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = SessionKey::new("cli", RoomType::Direct, "none");
        assert!(store.resume(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn schema_mismatch_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = SessionKey::new("cli", RoomType::Direct, "old");

        let mut stale = record(&key, 1);
        stale.schema_version = 99;
        store.checkpoint_forced(&stale).await.unwrap();
        assert!(store.resume(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn debounce_skips_rapid_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        let key = SessionKey::new("cli", RoomType::Direct, "fast");

        assert!(store.checkpoint(&record(&key, 1)).await.unwrap());
        assert!(!store.checkpoint(&record(&key, 2)).await.unwrap());
        // Forced writes bypass the debounce.
        store.checkpoint_forced(&record(&key, 3)).await.unwrap();
        assert_eq!(store.resume(&key).await.unwrap().unwrap().iteration, 3);
    }

    #[tokio::test]
    async fn rewrite_replaces_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = SessionKey::new("cli", RoomType::Direct, "twice");

        store.checkpoint_forced(&record(&key, 1)).await.unwrap();
        store.checkpoint_forced(&record(&key, 2)).await.unwrap();

        let session_dir = store.session_dir(&key);
        let files: Vec<_> = std::fs::read_dir(session_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("checkpoint")]);
        assert_eq!(store.resume(&key).await.unwrap().unwrap().iteration, 2);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = SessionKey::new("cli", RoomType::Direct, "gone");
        store.checkpoint_forced(&record(&key, 1)).await.unwrap();
        store.remove(&key).await.unwrap();
        store.remove(&key).await.unwrap();
        assert!(store.resume(&key).await.unwrap().is_none());
    }
}
