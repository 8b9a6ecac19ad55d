//! Sandboxed code execution.

use async_trait::async_trait;
use itak_core::{CostClass, Effect, Role, SideEffectClass};
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResult};
use crate::registry::{Tool, ToolOutcome, ToolSpec};
use crate::sandbox::{SandboxRequest, run_sandboxed};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_TIMEOUT_SECS: u64 = 600;

static SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: "code_exec",
    description: "Run a shell command in an isolated scratch directory.",
    usage_prompt: "Runs under a fresh working directory with a scrubbed \
                   environment and a wall-clock limit. Use for computation and \
                   file manipulation; network access follows the deployment's \
                   allowlist policy.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "command": {"type": "string", "description": "Shell command to run"},
            "timeout_secs": {"type": "integer", "minimum": 1, "maximum": 600}
        },
        "required": ["command"]
    }),
    required_role: Role::Sudo,
    side_effect: SideEffectClass::Execute,
    timeout: Duration::from_secs(MAX_TIMEOUT_SECS),
    cost_class: CostClass::Free,
});

#[derive(Debug, Deserialize)]
struct Args {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// `code_exec`: sandboxed subprocess with output capping handled by the
/// executor's capture stage.
#[derive(Debug, Default)]
pub struct CodeExecTool;

#[async_trait]
impl Tool for CodeExecTool {
    fn spec(&self) -> &ToolSpec {
        &SPEC
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let args: Args =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
        let wall_clock = Duration::from_secs(
            args.timeout_secs
                .unwrap_or(DEFAULT_TIMEOUT_SECS)
                .min(MAX_TIMEOUT_SECS),
        );

        let request = SandboxRequest {
            program: "bash".to_string(),
            args: vec!["-c".to_string(), args.command],
            wall_clock,
            env_passthrough: Vec::new(),
        };
        // The executor already guards the overall call; the sandbox gets
        // its own token so a tool-level timeout maps to Timeout, not
        // Cancelled.
        let output = run_sandboxed(&ctx.work_root, &request, &CancellationToken::new()).await?;

        let mut text = String::new();
        if !output.stdout.is_empty() {
            text.push_str(&output.stdout);
        }
        if !output.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("STDERR:\n");
            text.push_str(&output.stderr);
        }
        if output.exit_code != 0 {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("(exit code: {})", output.exit_code));
        }
        if text.is_empty() {
            text.push_str("(no output)");
        }

        Ok(ToolOutcome::text(text).with_effect(Effect::FileWritten {
            path: output
                .work_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("scratch")
                .to_string(),
        }))
    }
}
