//! Sub-agent delegation contract.
//!
//! The `delegate_task` tool delegates through this trait; the runtime
//! injects its implementation into the per-turn [`ToolContext`](crate::ToolContext)
//! so this crate never depends on the scheduler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ToolResult;

/// How subtasks are scheduled across sub-agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStrategy {
    /// Fan out every subtask at once.
    #[default]
    Parallel,
    /// Each sub-agent's output seeds the next subtask.
    Sequential,
    /// Streaming hand-off: each sub-agent consumes the prior's output as
    /// it arrives.
    Pipeline,
}

/// How a parallel swarm waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Wait for every sub-agent; a failure surfaces an aggregate error but
    /// never cancels peers.
    #[default]
    All,
    /// Return on the first success and cancel outstanding peers.
    First,
}

/// How sub-agent outputs merge into one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Ordered concatenation.
    #[default]
    Concat,
    /// Utility-model reduction.
    Summarize,
    /// Utility-model ranking, top output wins.
    Best,
    /// Caller-supplied reducer registered with the coordinator.
    Custom,
}

/// A delegation request from the `delegate_task` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRequest {
    /// Sub-agent profile name.
    pub profile: String,
    /// Subtask descriptions.
    pub subtasks: Vec<String>,
    /// Scheduling strategy.
    #[serde(default)]
    pub strategy: SpawnStrategy,
    /// Wait mode for parallel swarms.
    #[serde(default)]
    pub wait: WaitMode,
    /// Merge strategy.
    #[serde(default)]
    pub merge: MergeStrategy,
    /// Curated context snippet handed to each sub-agent.
    #[serde(default)]
    pub context: String,
    /// Overall timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

impl DelegationRequest {
    /// Overall timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Runs a delegation and returns the merged result text.
#[async_trait]
pub trait SubAgentSpawner: Send + Sync {
    /// Run the request to completion (or timeout) and merge.
    async fn delegate(&self, request: DelegationRequest) -> ToolResult<String>;
}
