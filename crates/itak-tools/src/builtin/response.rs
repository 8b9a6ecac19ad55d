//! The terminal tool: emits the final user-visible message.

use async_trait::async_trait;
use itak_core::{CostClass, Role, SideEffectClass};
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResult};
use crate::registry::{Tool, ToolOutcome, ToolSpec};

static SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: crate::RESPONSE_TOOL,
    description: "Send the final response to the user and finish the task.",
    usage_prompt: "Call this exactly once, when the task is complete. The text \
                   becomes the user-visible answer and the loop ends.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "text": {"type": "string", "description": "The final answer"}
        },
        "required": ["text"]
    }),
    required_role: Role::User,
    side_effect: SideEffectClass::None,
    timeout: Duration::from_secs(5),
    cost_class: CostClass::Free,
});

#[derive(Debug, Deserialize)]
struct Args {
    text: String,
}

/// Terminal tool. The scheduler sets the working-context terminal flag
/// after processing this tool's content and exits the loop.
#[derive(Debug, Default)]
pub struct ResponseTool;

#[async_trait]
impl Tool for ResponseTool {
    fn spec(&self) -> &ToolSpec {
        &SPEC
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let args: Args =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
        Ok(ToolOutcome::text(args.text))
    }
}
