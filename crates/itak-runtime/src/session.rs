//! Sessions: per-(principal, channel, room) state and persistence.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use itak_core::{Principal, SessionKey, Turn, WorkingContext};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::RuntimeResult;

/// How many transcript turns are replayed into memory on load.
const REPLAY_TAIL: usize = 500;

/// One conversational session. The transcript is append-only; turns older
/// than the pressure window get replaced by summary turns during
/// compaction (their raw content having moved to recall).
#[derive(Debug)]
pub struct AgentSession {
    /// Stable key.
    pub key: SessionKey,
    /// Owning principal.
    pub principal: Principal,
    /// In-memory transcript view (compacted).
    pub transcript: Vec<Turn>,
    /// The scheduler's working context while a task is active.
    pub working: Option<WorkingContext>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last activity.
    pub last_active: DateTime<Utc>,
}

impl AgentSession {
    /// Create a fresh session.
    #[must_use]
    pub fn new(key: SessionKey, principal: Principal) -> Self {
        let now = Utc::now();
        Self {
            key,
            principal,
            transcript: Vec::new(),
            working: None,
            created_at: now,
            last_active: now,
        }
    }

    /// Append a turn and bump activity.
    pub fn append(&mut self, turn: Turn) {
        self.last_active = Utc::now();
        self.transcript.push(turn);
    }

    /// The last `n` turns.
    #[must_use]
    pub fn tail(&self, n: usize) -> &[Turn] {
        let start = self.transcript.len().saturating_sub(n);
        &self.transcript[start..]
    }

    /// Approximate prompt tokens for the current transcript (char/4).
    #[must_use]
    pub fn estimated_tokens(&self) -> usize {
        self.transcript
            .iter()
            .map(|t| t.content.len())
            .sum::<usize>()
            .div_ceil(4)
    }

    /// Replace the oldest `count` turns with a single summary turn.
    /// The caller has already moved the raw content to recall.
    pub fn compact(&mut self, count: usize, summary: Turn) {
        let count = count.min(self.transcript.len());
        self.transcript.drain(..count);
        self.transcript.insert(0, summary);
    }

    /// The oldest block of raw (non-summary) turns, up to `max`.
    #[must_use]
    pub fn oldest_raw_block(&self, max: usize) -> Vec<Turn> {
        self.transcript
            .iter()
            .take_while(|t| !t.is_summary())
            .take(max)
            .cloned()
            .collect()
    }
}

/// Listing entry for `GET /sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session key.
    pub key: SessionKey,
    /// Transcript length.
    pub turns: usize,
    /// Last activity.
    pub last_active: DateTime<Utc>,
    /// Whether a task is mid-flight.
    pub active: bool,
}

/// In-memory session registry with append-only JSONL transcripts under
/// `data/sessions/<key>/transcript`.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    sessions: DashMap<SessionKey, Arc<Mutex<AgentSession>>>,
}

impl SessionStore {
    /// Create a store rooted at `root` (`data/sessions`).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: DashMap::new(),
        }
    }

    fn transcript_path(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.as_path_segment()).join("transcript")
    }

    /// The media directory for a session.
    #[must_use]
    pub fn media_dir(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.as_path_segment()).join("media")
    }

    /// Fetch a live session, loading the transcript tail from disk on
    /// first touch.
    pub async fn load_or_create(
        &self,
        key: &SessionKey,
        principal: &Principal,
    ) -> Arc<Mutex<AgentSession>> {
        if let Some(existing) = self.sessions.get(key) {
            return Arc::clone(&existing);
        }

        let mut session = AgentSession::new(key.clone(), principal.clone());
        match tokio::fs::read_to_string(self.transcript_path(key)).await {
            Ok(body) => {
                let mut turns: Vec<Turn> = body
                    .lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect();
                let skip = turns.len().saturating_sub(REPLAY_TAIL);
                session.transcript = turns.split_off(skip);
                debug!(session = %key, turns = session.transcript.len(), "Transcript replayed");
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(session = %key, error = %e, "Transcript unreadable, starting fresh"),
        }

        let session = Arc::new(Mutex::new(session));
        self.sessions.insert(key.clone(), Arc::clone(&session));
        session
    }

    /// Look up a live session without creating one.
    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Mutex<AgentSession>>> {
        self.sessions.get(key).map(|s| Arc::clone(&s))
    }

    /// Append a turn to the on-disk transcript log.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the session directory cannot be written.
    pub async fn persist_turn(&self, key: &SessionKey, turn: &Turn) -> RuntimeResult<()> {
        let path = self.transcript_path(key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut line = serde_json::to_string(turn)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Summaries of every live session.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for entry in &self.sessions {
            let session = entry.value().lock().await;
            summaries.push(SessionSummary {
                key: session.key.clone(),
                turns: session.transcript.len(),
                last_active: session.last_active,
                active: session.working.is_some(),
            });
        }
        summaries.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        summaries
    }

    /// Archive a session: drop it from memory and delete its directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory removal fails.
    pub async fn archive(&self, key: &SessionKey) -> RuntimeResult<()> {
        self.sessions.remove(key);
        let dir = self.root.join(key.as_path_segment());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itak_core::{Role, RoomType};

    fn key() -> SessionKey {
        SessionKey::new("cli", RoomType::Direct, "store-test")
    }

    #[tokio::test]
    async fn transcript_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let principal = Principal::new("tester", Role::User);
        let key = key();

        {
            let store = SessionStore::new(dir.path());
            let session = store.load_or_create(&key, &principal).await;
            let turn = Turn::user("hello");
            session.lock().await.append(turn.clone());
            store.persist_turn(&key, &turn).await.unwrap();
        }

        let store = SessionStore::new(dir.path());
        let session = store.load_or_create(&key, &principal).await;
        let session = session.lock().await;
        assert_eq!(session.transcript.len(), 1);
        assert_eq!(session.transcript[0].content, "hello");
    }

    #[tokio::test]
    async fn compaction_replaces_oldest_block() {
        let principal = Principal::new("tester", Role::User);
        let mut session = AgentSession::new(key(), principal);
        for i in 0..5 {
            session.append(Turn::user(format!("turn {i}")));
        }

        let block = session.oldest_raw_block(3);
        assert_eq!(block.len(), 3);
        let summary = Turn::system("summary").as_summary((block[0].ts, block[2].ts));
        session.compact(3, summary);

        assert_eq!(session.transcript.len(), 3);
        assert!(session.transcript[0].is_summary());
        assert_eq!(session.transcript[1].content, "turn 3");
    }

    #[tokio::test]
    async fn archive_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let principal = Principal::new("tester", Role::User);
        let key = key();

        let _ = store.load_or_create(&key, &principal).await;
        let turn = Turn::user("bye");
        store.persist_turn(&key, &turn).await.unwrap();
        store.archive(&key).await.unwrap();

        assert!(store.get(&key).is_none());
        assert!(!dir.path().join(key.as_path_segment()).exists());
    }
}
