//! Working context: the scheduler's mutable plan-and-step state.
//!
//! Exists only while a task is actively processed. The scheduler owns it;
//! the checkpoint manager holds the durable mirror, so every field must be
//! serializable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskId;

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    #[default]
    Pending,
    /// Currently executing.
    Active,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
}

/// One step of the current plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    /// Step description as planned by the model.
    pub description: String,
    /// Current status.
    #[serde(default)]
    pub status: StepStatus,
    /// One-line result summary once the step ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl StepState {
    /// Create a pending step.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: StepStatus::Pending,
            summary: None,
        }
    }
}

/// An artifact produced during task execution (spilled tool output,
/// downloaded media, generated file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Stable id, also the filename under the session `media/` directory.
    pub id: Uuid,
    /// Human-readable label.
    pub label: String,
    /// Media type hint (`text/plain`, `image/png`, ...).
    pub content_type: String,
    /// Size in bytes.
    pub bytes: u64,
}

impl Artifact {
    /// Create a new artifact record.
    #[must_use]
    pub fn new(label: impl Into<String>, content_type: impl Into<String>, bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// The scheduler's mutable state for one in-flight task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingContext {
    /// The task being worked.
    pub task_id: TaskId,
    /// Planned steps.
    pub plan: Vec<StepState>,
    /// Index into `plan` of the step currently executing.
    pub current_step: usize,
    /// Artifacts produced so far.
    pub artifacts: Vec<Artifact>,
    /// Free-form decision notes the model has committed to.
    pub decisions: Vec<String>,
    /// Error signatures already seen this task (self-healer dedup).
    pub errors_seen: Vec<String>,
    /// Monologue iterations consumed so far.
    pub iteration_count: u32,
    /// When the task started.
    pub started_at: DateTime<Utc>,
    /// Set by the `response` tool; the scheduler exits the loop when true.
    #[serde(default)]
    pub terminal: bool,
    /// Set when the monologue was cancelled mid-flight.
    #[serde(default)]
    pub cancelled: bool,
}

impl WorkingContext {
    /// Create a fresh working context for a task.
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            plan: Vec::new(),
            current_step: 0,
            artifacts: Vec::new(),
            decisions: Vec::new(),
            errors_seen: Vec::new(),
            iteration_count: 0,
            started_at: Utc::now(),
            terminal: false,
            cancelled: false,
        }
    }

    /// The step currently executing, if the plan is non-empty.
    #[must_use]
    pub fn active_step(&self) -> Option<&StepState> {
        self.plan.get(self.current_step)
    }

    /// Mark the active step done with a summary and advance.
    pub fn complete_step(&mut self, summary: impl Into<String>) {
        if let Some(step) = self.plan.get_mut(self.current_step) {
            step.status = StepStatus::Done;
            step.summary = Some(summary.into());
        }
        self.current_step = self.current_step.saturating_add(1);
        if let Some(next) = self.plan.get_mut(self.current_step) {
            next.status = StepStatus::Active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_advance() {
        let mut wc = WorkingContext::new(TaskId::new());
        wc.plan = vec![StepState::new("a"), StepState::new("b")];
        wc.plan[0].status = StepStatus::Active;

        wc.complete_step("did a");
        assert_eq!(wc.current_step, 1);
        assert_eq!(wc.plan[0].status, StepStatus::Done);
        assert_eq!(wc.plan[1].status, StepStatus::Active);
    }

    #[test]
    fn survives_serde_round_trip() {
        let mut wc = WorkingContext::new(TaskId::new());
        wc.plan = vec![StepState::new("only")];
        wc.iteration_count = 3;
        let json = serde_json::to_string(&wc).unwrap();
        let back: WorkingContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.iteration_count, 3);
        assert_eq!(back.plan.len(), 1);
    }
}
