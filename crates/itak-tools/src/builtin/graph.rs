//! Direct knowledge-graph operations.

use async_trait::async_trait;
use itak_core::{CostClass, GraphRelation, MemoryId, Role, SideEffectClass};
use itak_store::GraphStore;
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResult};
use crate::registry::{Tool, ToolOutcome, ToolSpec};

static SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: "knowledge_graph",
    description: "Upsert or query entity relations directly.",
    usage_prompt: "Use `op: \"upsert\"` with subject/predicate/object to assert \
                   a relation, or `op: \"neighbors\"` with entities to explore \
                   the graph up to two hops.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "op": {"type": "string", "enum": ["upsert", "neighbors"]},
            "subject": {"type": "string"},
            "predicate": {"type": "string"},
            "object": {"type": "string"},
            "entities": {"type": "array", "items": {"type": "string"}},
            "hops": {"type": "integer", "minimum": 1, "maximum": 2}
        },
        "required": ["op"]
    }),
    required_role: Role::Sudo,
    side_effect: SideEffectClass::Write,
    timeout: Duration::from_secs(15),
    cost_class: CostClass::Free,
});

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Args {
    Upsert {
        subject: String,
        predicate: String,
        object: String,
    },
    Neighbors {
        entities: Vec<String>,
        #[serde(default)]
        hops: Option<u8>,
    },
}

/// `knowledge_graph`: entity/relation upserts and bounded traversal.
#[derive(Debug, Default)]
pub struct KnowledgeGraphTool;

#[async_trait]
impl Tool for KnowledgeGraphTool {
    fn spec(&self) -> &ToolSpec {
        &SPEC
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let args: Args =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;

        match args {
            Args::Upsert {
                subject,
                predicate,
                object,
            } => {
                let relation =
                    GraphRelation::new(subject, predicate, object, MemoryId::new(), 1.0);
                ctx.graph.upsert_relation(&relation).await?;
                Ok(ToolOutcome::text(format!(
                    "Asserted: {} -[{}]-> {}",
                    relation.subject_entity, relation.predicate, relation.object_entity
                )))
            },
            Args::Neighbors { entities, hops } => {
                let edges = ctx
                    .graph
                    .traverse(&entities, hops.unwrap_or(2).min(2), 50)
                    .await?;
                if edges.is_empty() {
                    return Ok(ToolOutcome::text("No relations found."));
                }
                let listing = edges
                    .iter()
                    .map(|e| {
                        format!(
                            "- {} -[{}]-> {} (confidence {:.2})",
                            e.subject_entity, e.predicate, e.object_entity, e.confidence
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(ToolOutcome::text(listing))
            },
        }
    }
}
