//! Task records and their state machine.
//!
//! Transitions: `inbox → in_progress → {review, done, failed, cancelled}`;
//! `review → in_progress | done | cancelled`. Terminal states are immutable;
//! the gateway enforces transitions server-side through [`TaskStatus::can_transition_to`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::session::SessionKey;
use crate::working::StepState;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new random task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, not yet started.
    Inbox,
    /// Actively being worked.
    InProgress,
    /// Awaiting human review.
    Review,
    /// Completed successfully. Terminal.
    Done,
    /// Completed unsuccessfully. Terminal.
    Failed,
    /// Abandoned. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine admits `self → next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Inbox => matches!(next, Self::InProgress | Self::Cancelled),
            Self::InProgress => matches!(
                next,
                Self::Review | Self::Done | Self::Failed | Self::Cancelled
            ),
            Self::Review => matches!(next, Self::InProgress | Self::Done | Self::Cancelled),
            Self::Done | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox => write!(f, "inbox"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Review => write!(f, "review"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work tracked across monologues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable id.
    pub id: TaskId,
    /// Short title.
    pub title: String,
    /// Full description.
    pub description: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Scheduling priority (higher first).
    pub priority: i32,
    /// Planned steps.
    pub steps: Vec<StepState>,
    /// Produced deliverables (artifact ids or inline text).
    pub deliverables: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When work began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The session the task originated from.
    pub source_session: SessionKey,
    /// Errors accumulated while working.
    #[serde(default)]
    pub error_log: Vec<String>,
}

impl Task {
    /// Create a new inbox task.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        source_session: SessionKey,
    ) -> Self {
        Self {
            id: TaskId::new(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Inbox,
            priority: 0,
            steps: Vec::new(),
            deliverables: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            source_session,
            error_log: Vec::new(),
        }
    }

    /// Attempt a state transition, stamping `started_at`/`completed_at`.
    ///
    /// # Errors
    ///
    /// Returns the rejected `(from, to)` pair when the state machine does
    /// not admit the transition.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), (TaskStatus, TaskStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        if next == TaskStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RoomType;

    fn task() -> Task {
        Task::new(
            "port scan",
            "check open ports",
            SessionKey::new("cli", RoomType::Direct, "local"),
        )
    }

    #[test]
    fn happy_path() {
        let mut t = task();
        t.transition(TaskStatus::InProgress).unwrap();
        assert!(t.started_at.is_some());
        t.transition(TaskStatus::Review).unwrap();
        t.transition(TaskStatus::Done).unwrap();
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut t = task();
        t.transition(TaskStatus::InProgress).unwrap();
        t.transition(TaskStatus::Failed).unwrap();
        assert_eq!(
            t.transition(TaskStatus::InProgress),
            Err((TaskStatus::Failed, TaskStatus::InProgress))
        );
    }

    #[test]
    fn inbox_cannot_jump_to_done() {
        let mut t = task();
        assert!(t.transition(TaskStatus::Done).is_err());
    }
}
