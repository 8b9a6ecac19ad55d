//! Sub-agent delegation tool.

use async_trait::async_trait;
use itak_core::{CostClass, Effect, Role, SideEffectClass};
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResult};
use crate::registry::{Tool, ToolOutcome, ToolSpec};
use crate::spawner::DelegationRequest;

static SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: "delegate_task",
    description: "Split work across sub-agents and return the merged result.",
    usage_prompt: "Use for work that parallelizes (research angles, independent \
                   chunks). Returns only after the swarm finishes or times out. \
                   You cannot delegate to your own profile.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "profile": {"type": "string", "description": "Sub-agent profile name"},
            "subtasks": {"type": "array", "items": {"type": "string"}, "minItems": 1},
            "strategy": {"type": "string", "enum": ["parallel", "sequential", "pipeline"]},
            "wait": {"type": "string", "enum": ["all", "first"]},
            "merge": {"type": "string", "enum": ["concat", "summarize", "best", "custom"]},
            "context": {"type": "string"},
            "timeout_secs": {"type": "integer", "minimum": 10, "maximum": 1800}
        },
        "required": ["profile", "subtasks"]
    }),
    required_role: Role::Sudo,
    side_effect: SideEffectClass::Execute,
    timeout: Duration::from_secs(1830),
    cost_class: CostClass::Expensive,
});

/// `delegate_task`: runs a swarm through the runtime-injected spawner and
/// returns only the merged result.
#[derive(Debug, Default)]
pub struct DelegateTool;

#[async_trait]
impl Tool for DelegateTool {
    fn spec(&self) -> &ToolSpec {
        &SPEC
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let request: DelegationRequest =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
        if request.subtasks.is_empty() {
            return Err(ToolError::InvalidArgs("subtasks must be non-empty".into()));
        }

        let Some(spawner) = ctx.spawner().await else {
            return Err(ToolError::Execution(
                "sub-agent spawning is not available in this context".into(),
            ));
        };

        let count = request.subtasks.len();
        let merged = spawner.delegate(request).await?;
        Ok(ToolOutcome::text(merged).with_effect(Effect::Delegation { count }))
    }
}
