//! Tool trait, specs, and the static registry.

use async_trait::async_trait;
use itak_core::{CostClass, Effect, Role, SideEffectClass};
use itak_core::Artifact;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ToolContext;
use crate::error::ToolResult;

/// Static description of a tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Registered name.
    pub name: &'static str,
    /// One-line description for listings.
    pub description: &'static str,
    /// Usage prompt injected into the system prompt.
    pub usage_prompt: &'static str,
    /// JSON schema of the arguments, shown to the model.
    pub input_schema: Value,
    /// Minimum role allowed to call.
    pub required_role: Role,
    /// Side-effect class.
    pub side_effect: SideEffectClass,
    /// Wall-clock budget.
    pub timeout: Duration,
    /// Coarse cost bucket.
    pub cost_class: CostClass,
}

/// A successful tool body result, before capture and shaping.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    /// Raw result text (redacted by the executor, not the tool).
    pub content: String,
    /// Model spend inside the tool, if any.
    pub cost: Option<f64>,
    /// Artifacts produced by the body itself.
    pub artifacts: Vec<Artifact>,
    /// Reported side effects.
    pub side_effects: Vec<Effect>,
}

impl ToolOutcome {
    /// A plain text outcome.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Attach a side effect.
    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.side_effects.push(effect);
        self
    }
}

/// A capability the scheduler can dispatch.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static spec.
    fn spec(&self) -> &ToolSpec;

    /// Execute with already-validated, already-expanded arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome>;
}

/// Registry of tools, populated at init. No runtime code loading.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Later registrations with the same name replace
    /// earlier ones.
    #[must_use]
    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.spec().name, tool);
        self
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Tools visible to the given role, name-ordered.
    #[must_use]
    pub fn visible_for(&self, role: Role) -> Vec<&Arc<dyn Tool>> {
        self.tools
            .values()
            .filter(|t| role >= t.spec().required_role)
            .collect()
    }

    /// The tool-usage block for the system prompt: every tool the role may
    /// call, with its usage prompt and schema.
    #[must_use]
    pub fn prompt_block(&self, role: Role) -> String {
        let mut block = String::from("# Tools\n\n");
        for tool in self.visible_for(role) {
            let spec = tool.spec();
            block.push_str(&format!(
                "## {}\n{}\n{}\nArguments schema: {}\n\n",
                spec.name, spec.description, spec.usage_prompt, spec.input_schema
            ));
        }
        block
    }

    /// All registered names.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
