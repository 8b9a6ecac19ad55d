//! The progress channel.
//!
//! The scheduler publishes step boundaries, presence changes, and the
//! final response on a broadcast bus. Adapters subscribe and format per
//! their medium (edit-in-place for chat, push events for the dashboard).

use itak_core::{SessionKey, SurfacedError};
use serde::Serialize;

/// Presence states adapters can map to their medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// Nothing in flight.
    Idle,
    /// Model call in progress.
    Thinking,
    /// Tool executing.
    ToolUse,
    /// Memory or web search in progress.
    Searching,
    /// Streaming the final answer.
    Writing,
    /// Something went wrong.
    Error,
}

/// One event on the progress bus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressEvent {
    /// The monologue announced its plan.
    Plan {
        /// Session.
        session: SessionKey,
        /// Planned step descriptions.
        steps: Vec<String>,
    },
    /// A step is starting.
    StepStart {
        /// Session.
        session: SessionKey,
        /// Step index.
        step: usize,
        /// Step description (the tool being run).
        description: String,
    },
    /// A step finished.
    StepEnd {
        /// Session.
        session: SessionKey,
        /// Step index.
        step: usize,
        /// One-line summary, or the error text.
        summary: String,
        /// Whether the step succeeded.
        ok: bool,
    },
    /// Presence change.
    Presence {
        /// Session.
        session: SessionKey,
        /// New state.
        state: PresenceState,
    },
    /// The single user-visible response for the triggering message.
    Final {
        /// Session.
        session: SessionKey,
        /// Response text.
        text: String,
    },
    /// A structured error surfaced to the user.
    Error {
        /// Session.
        session: SessionKey,
        /// The report.
        report: SurfacedError,
    },
}

impl ProgressEvent {
    /// The session an event belongs to.
    #[must_use]
    pub fn session(&self) -> &SessionKey {
        match self {
            Self::Plan { session, .. }
            | Self::StepStart { session, .. }
            | Self::StepEnd { session, .. }
            | Self::Presence { session, .. }
            | Self::Final { session, .. }
            | Self::Error { session, .. } => session,
        }
    }
}
