//! Memory tools: load, save, forget. All three go through the fabric.

use async_trait::async_trait;
use itak_core::{CostClass, Effect, MemoryId, Priority, Role, SideEffectClass};
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use uuid::Uuid;

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResult};
use crate::registry::{Tool, ToolOutcome, ToolSpec};
use itak_memory::RememberOptions;

static SAVE_SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: "memory_save",
    description: "Persist a fact to long-term memory.",
    usage_prompt: "Use when the user asks you to remember something, or when you \
                   learn a durable fact worth keeping. Saves are deduplicated.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "content": {"type": "string", "description": "The fact to remember"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "priority": {"type": "string", "enum": ["normal", "high", "critical"]}
        },
        "required": ["content"]
    }),
    required_role: Role::User,
    side_effect: SideEffectClass::Write,
    timeout: Duration::from_secs(30),
    cost_class: CostClass::Cheap,
});

#[derive(Debug, Deserialize)]
struct SaveArgs {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    priority: Option<Priority>,
}

/// `memory_save`: write-through save with async archival derivation.
#[derive(Debug, Default)]
pub struct MemorySaveTool;

#[async_trait]
impl Tool for MemorySaveTool {
    fn spec(&self) -> &ToolSpec {
        &SAVE_SPEC
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let args: SaveArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
        let id = ctx
            .memory
            .remember(
                ctx.principal.id,
                &args.content,
                RememberOptions {
                    priority: args.priority.unwrap_or_default(),
                    tags: args.tags,
                    source_session: Some(ctx.session_key.clone()),
                },
            )
            .await?;
        Ok(
            ToolOutcome::text(format!("Saved to memory (id {id})."))
                .with_effect(Effect::MemoryWrite { id: id.to_string() }),
        )
    }
}

static LOAD_SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: "memory_load",
    description: "Search long-term memory.",
    usage_prompt: "Use when the answer may live in saved memories. Returns the \
                   best-matching entries for your query.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "query": {"type": "string"},
            "k": {"type": "integer", "minimum": 1, "maximum": 20}
        },
        "required": ["query"]
    }),
    required_role: Role::User,
    side_effect: SideEffectClass::Read,
    timeout: Duration::from_secs(30),
    cost_class: CostClass::Cheap,
});

#[derive(Debug, Deserialize)]
struct LoadArgs {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

/// `memory_load`: hybrid search over the fabric.
#[derive(Debug, Default)]
pub struct MemoryLoadTool;

#[async_trait]
impl Tool for MemoryLoadTool {
    fn spec(&self) -> &ToolSpec {
        &LOAD_SPEC
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let args: LoadArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
        let hits = ctx
            .memory
            .search(ctx.principal.id, &args.query, args.k.unwrap_or(5).clamp(1, 20))
            .await?;
        if hits.is_empty() {
            return Ok(ToolOutcome::text("No matching memories."));
        }
        let listing = hits
            .iter()
            .map(|e| format!("- [{}] {} (saved {})", e.id, e.content, e.created_at.date_naive()))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutcome::text(format!("Matching memories:\n{listing}")))
    }
}

static FORGET_SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: "memory_forget",
    description: "Delete a memory from every tier.",
    usage_prompt: "Two-step: call with only a query first to list candidates, \
                   then call again with confirm_id set to the entry to delete.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "query": {"type": "string"},
            "confirm_id": {"type": "string", "description": "Id of the entry to delete"}
        },
        "required": ["query"]
    }),
    required_role: Role::Sudo,
    side_effect: SideEffectClass::Write,
    timeout: Duration::from_secs(30),
    cost_class: CostClass::Free,
});

#[derive(Debug, Deserialize)]
struct ForgetArgs {
    query: String,
    #[serde(default)]
    confirm_id: Option<String>,
}

/// `memory_forget`: confirmatory search, then multi-tier delete.
#[derive(Debug, Default)]
pub struct MemoryForgetTool;

#[async_trait]
impl Tool for MemoryForgetTool {
    fn spec(&self) -> &ToolSpec {
        &FORGET_SPEC
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let args: ForgetArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;

        if let Some(raw_id) = args.confirm_id {
            let id = raw_id
                .parse::<Uuid>()
                .map(MemoryId)
                .map_err(|e| ToolError::InvalidArgs(format!("confirm_id: {e}")))?;
            ctx.memory.forget(id).await?;
            return Ok(
                ToolOutcome::text(format!("Deleted memory {id} from all tiers."))
                    .with_effect(Effect::MemoryWrite { id: id.to_string() }),
            );
        }

        let candidates = ctx
            .memory
            .forget_candidates(ctx.principal.id, &args.query)
            .await?;
        if candidates.is_empty() {
            return Ok(ToolOutcome::text("No matching memories to forget."));
        }
        let listing = candidates
            .iter()
            .map(|e| format!("- [{}] {}", e.id, e.content))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutcome::text(format!(
            "Candidates (call again with confirm_id to delete):\n{listing}"
        )))
    }
}
