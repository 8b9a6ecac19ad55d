//! Transcript turns.
//!
//! Turns are append-only. Turns older than the configured window are
//! replaced by summary turns that preserve the original timestamp span.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// The human.
    User,
    /// The agent.
    Assistant,
    /// A tool result fed back into the loop.
    Tool,
    /// Runtime-injected context (resume notices, corrections).
    System,
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
            Self::System => write!(f, "system"),
        }
    }
}

/// One transcript entry. Never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// When the turn was appended.
    pub ts: DateTime<Utc>,
    /// Producer.
    pub role: TurnRole,
    /// Turn text. For tool turns this is the redacted result content.
    pub content: String,
    /// Free-form metadata (tool name, artifact ids, adapter hints).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// Prompt tokens attributed to this turn, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<usize>,
    /// Completion tokens attributed to this turn, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<usize>,
    /// Dollar cost attributed to this turn, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Set on summary turns: the timestamp span of the raw turns this
    /// summary replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_span: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Turn {
    /// Create a turn with the given role and content, stamped now.
    #[must_use]
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            role,
            content: content.into(),
            metadata: Value::Null,
            tokens_in: None,
            tokens_out: None,
            cost: None,
            summarized_span: None,
        }
    }

    /// A user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    /// An assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    /// A tool-result turn.
    #[must_use]
    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Tool, content)
    }

    /// A system turn.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, content)
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Mark this turn as a summary replacing raw turns over `span`.
    #[must_use]
    pub fn as_summary(mut self, span: (DateTime<Utc>, DateTime<Utc>)) -> Self {
        self.summarized_span = Some(span);
        self
    }

    /// Whether this turn is a compaction summary.
    #[must_use]
    pub fn is_summary(&self) -> bool {
        self.summarized_span.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_preserves_span() {
        let start = Utc::now();
        let end = Utc::now();
        let turn = Turn::system("summary of 12 turns").as_summary((start, end));
        assert!(turn.is_summary());
        assert_eq!(turn.summarized_span, Some((start, end)));
    }

    #[test]
    fn serializes_without_empty_fields() {
        let json = serde_json::to_value(Turn::user("hi")).unwrap();
        assert!(json.get("tokens_in").is_none());
        assert!(json.get("metadata").is_none());
    }
}
