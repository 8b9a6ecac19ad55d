//! Tool call and result shapes shared by the registry, the executor, and
//! the scheduler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::principal::PrincipalId;
use crate::session::SessionKey;
use crate::working::Artifact;

/// How a tool touches the world. Drives sandbox strictness and audit level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    /// Pure computation or in-process reads.
    None,
    /// Reads external state (search, fetch, memory load).
    Read,
    /// Writes agent-owned state (memory save, task updates).
    Write,
    /// Executes arbitrary code or reaches arbitrary hosts.
    Execute,
}

/// Coarse cost bucket used by the limiter for estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    /// No model spend.
    #[default]
    Free,
    /// Utility-model scale spend.
    Cheap,
    /// Chat-model scale spend (delegation, summarization).
    Expensive,
}

/// A side effect a tool reported performing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Effect {
    /// A file was written under the work root.
    FileWritten {
        /// Path relative to the work root.
        path: String,
    },
    /// A network request was made.
    NetworkCall {
        /// Target host.
        host: String,
    },
    /// A memory entry was created or updated.
    MemoryWrite {
        /// The entry id.
        id: String,
    },
    /// A sub-agent swarm was run.
    Delegation {
        /// Number of sub-agents spawned.
        count: usize,
    },
}

/// A tool invocation as parsed from model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Registered tool name.
    pub name: String,
    /// Arguments, schema-checked by the executor.
    pub args: Value,
    /// Principal on whose behalf the call runs.
    pub caller_principal: PrincipalId,
    /// Session the call belongs to.
    pub session_key: SessionKey,
    /// Monologue iteration that produced the call.
    pub iteration: u32,
}

impl fmt::Display for ToolCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.name, self.session_key, self.iteration)
    }
}

/// The shaped result of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Whether the tool succeeded.
    pub ok: bool,
    /// Redacted result text fed back into the loop.
    pub content: String,
    /// Error message when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Dollar cost incurred, when the tool spent model budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Artifacts produced (spilled output, downloads).
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Reported side effects.
    #[serde(default)]
    pub side_effects: Vec<Effect>,
}

impl ToolOutput {
    /// A successful result.
    #[must_use]
    pub fn ok(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            ok: true,
            content: content.into(),
            error: None,
            cost: None,
            duration,
            artifacts: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    /// A failed result.
    #[must_use]
    pub fn err(error: impl Into<String>, duration: Duration) -> Self {
        let error = error.into();
        Self {
            ok: false,
            content: String::new(),
            error: Some(error),
            cost: None,
            duration,
            artifacts: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    /// Attach a cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Attach artifacts.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Attach side effects.
    #[must_use]
    pub fn with_side_effects(mut self, effects: Vec<Effect>) -> Self {
        self.side_effects = effects;
        self
    }
}
