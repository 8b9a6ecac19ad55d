//! Network tools: web search and page fetch. Both pass their targets
//! through the SSRF guard and the host allowlist.

use async_trait::async_trait;
use itak_core::{CostClass, Effect, Role, SideEffectClass};
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResult};
use crate::registry::{Tool, ToolOutcome, ToolSpec};

static SEARCH_SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: "web_search",
    description: "Query the configured search service.",
    usage_prompt: "Use for current events and facts outside memory. Returns \
                   result snippets; follow up with `browser` for full pages.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "query": {"type": "string"}
        },
        "required": ["query"]
    }),
    required_role: Role::User,
    side_effect: SideEffectClass::Read,
    timeout: Duration::from_secs(30),
    cost_class: CostClass::Free,
});

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
}

/// `web_search`: GET against the configured search endpoint. The endpoint
/// may be a local service only when it is on the exemption list.
#[derive(Debug)]
pub struct WebSearchTool {
    /// Search endpoint; the query is appended as a `q` parameter.
    endpoint: String,
}

impl WebSearchTool {
    /// Create the tool for a search endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> &ToolSpec {
        &SEARCH_SPEC
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let args: SearchArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;

        let mut url = ctx.ssrf.check(&self.endpoint)?;
        url.query_pairs_mut().append_pair("q", &args.query);
        let host = url.host_str().unwrap_or_default().to_string();

        let body = ctx
            .http
            .get(url)
            .timeout(Duration::from_secs(25))
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("search request failed: {e}")))?
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("search body unreadable: {e}")))?;

        Ok(ToolOutcome::text(body).with_effect(Effect::NetworkCall { host }))
    }
}

static BROWSER_SPEC: LazyLock<ToolSpec> = LazyLock::new(|| ToolSpec {
    name: "browser",
    description: "Fetch a web page as text.",
    usage_prompt: "Use to read a specific URL found via search or given by the \
                   user. Private and local addresses are blocked.",
    input_schema: serde_json::json!({
        "type": "object",
        "properties": {
            "url": {"type": "string"}
        },
        "required": ["url"]
    }),
    required_role: Role::User,
    side_effect: SideEffectClass::Read,
    timeout: Duration::from_secs(45),
    cost_class: CostClass::Free,
});

#[derive(Debug, Deserialize)]
struct BrowserArgs {
    url: String,
}

/// `browser`: guarded page fetch. Oversized bodies are capped by the
/// executor's capture stage.
#[derive(Debug, Default)]
pub struct BrowserTool;

#[async_trait]
impl Tool for BrowserTool {
    fn spec(&self) -> &ToolSpec {
        &BROWSER_SPEC
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutcome> {
        let args: BrowserArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;

        let url = ctx.ssrf.check(&args.url)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let body = ctx
            .http
            .get(url)
            .timeout(Duration::from_secs(40))
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("fetch failed: {e}")))?
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("body unreadable: {e}")))?;

        Ok(ToolOutcome::text(body).with_effect(Effect::NetworkCall { host }))
    }
}
