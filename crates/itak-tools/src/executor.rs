//! The execution pipeline.
//!
//! Order per call: structural validation, permission check, just-in-time
//! secret expansion, pre-hook, sandboxed dispatch under timeout and
//! cancellation, capture through the output guard with artifact spill,
//! post-hook, result assembly.

use itak_core::{Artifact, ToolOutput};
use itak_hooks::{HookContext, HookRunner, LifecyclePoint};
use itak_limits::{RateLimiter, ReserveRequest};
use itak_vault::VaultError;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResult};
use crate::registry::{Tool, ToolOutcome, ToolRegistry};

/// Sentinel appended to truncated inline output.
const TRUNCATION_SENTINEL: &str = "[output truncated; full content in artifact ";

/// Dispatches tool calls through the fixed pipeline.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    hooks: Arc<HookRunner>,
    limiter: Arc<RateLimiter>,
}

impl ToolExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, hooks: Arc<HookRunner>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            registry,
            hooks,
            limiter,
        }
    }

    /// The registry, for prompt assembly.
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one tool call through the pipeline.
    ///
    /// # Errors
    ///
    /// Every pipeline stage maps to one [`ToolError`] variant; see the
    /// error type for the taxonomy. The tool body is never invoked for
    /// permission or validation failures.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        cancel: &CancellationToken,
    ) -> ToolResult<ToolOutput> {
        let started = Instant::now();
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let spec = tool.spec();

        // 1. Structural validation against the declared schema.
        validate_required(&spec.input_schema, &args)?;

        // 2. Permission check, before anything touches the body.
        if ctx.principal.role < spec.required_role {
            return Err(ToolError::PermissionDenied {
                tool: name.to_string(),
                required: spec.required_role,
                actual: ctx.principal.role,
            });
        }

        // Per-tool request bucket. Tool calls carry no direct model cost;
        // any model spend inside the tool goes through the router's own
        // reservations.
        let reservation = self.limiter.reserve(
            &ReserveRequest::new(ctx.principal.id, 0.0)
                .for_tool(name)
                .free(),
        )?;

        // 3. Just-in-time secret expansion on a scratch copy.
        let expanded = match expand_secrets(&args, ctx) {
            Ok(expanded) => expanded,
            Err(e) => {
                self.limiter.rollback(reservation);
                return Err(e);
            },
        };

        // 4. Pre-hook. A critical handler failure blocks the call.
        let pre = HookContext::new(LifecyclePoint::ToolExecuteBefore)
            .with_session(ctx.session_key.clone())
            .with_data("tool", Value::String(name.to_string()))
            .with_data("iteration", Value::from(ctx.iteration));
        if let Err(e) = self.hooks.dispatch(pre).await {
            self.limiter.rollback(reservation);
            return Err(ToolError::PolicyViolation(format!(
                "blocked before execution: {e}"
            )));
        }

        // 5. Sandboxed dispatch under timeout and cancellation.
        debug!(tool = name, session = %ctx.session_key, "Dispatching tool");
        let body = tokio::select! {
            () = cancel.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(spec.timeout, tool.execute(expanded, ctx)) => {
                result.unwrap_or(Err(ToolError::Timeout(spec.timeout)))
            },
        };

        let outcome = match body {
            Ok(outcome) => outcome,
            Err(e) => {
                self.limiter.rollback(reservation);
                let _ = self
                    .hooks
                    .dispatch(
                        HookContext::new(LifecyclePoint::ToolExecuteAfter)
                            .with_session(ctx.session_key.clone())
                            .with_data("tool", Value::String(name.to_string()))
                            .with_data("ok", Value::Bool(false)),
                    )
                    .await;
                return Err(e);
            },
        };
        self.limiter.commit(reservation, outcome.cost.unwrap_or(0.0), 0, 0);

        // 6. Capture: redact, then spill oversized output to an artifact.
        let (content, mut artifacts) = self.capture(outcome.content, ctx).await?;

        // 7. Post-hook. Handlers may fold a derived result back in (the
        // code-quality relint path).
        let post = HookContext::new(LifecyclePoint::ToolExecuteAfter)
            .with_session(ctx.session_key.clone())
            .with_data("tool", Value::String(name.to_string()))
            .with_data("ok", Value::Bool(true))
            .with_data("content", Value::String(content.clone()));
        let mut content = content;
        match self.hooks.dispatch(post).await {
            Ok(after) => {
                if let Some(derived) = after.get_str("derived_result") {
                    content.push_str("\n\n[derived] ");
                    content.push_str(derived);
                }
            },
            Err(e) => warn!(tool = name, error = %e, "Post-hook failed"),
        }

        // 8. Result assembly.
        artifacts.extend(outcome.artifacts);
        let duration = started.elapsed();
        info!(tool = name, ms = duration.as_millis(), "Tool finished");
        let mut output = ToolOutput::ok(content, duration).with_side_effects(outcome.side_effects);
        output.artifacts = artifacts;
        if let Some(cost) = outcome.cost {
            output = output.with_cost(cost);
        }
        Ok(output)
    }

    /// Redact and cap captured content, spilling the full (redacted) text
    /// to a per-session artifact when it exceeds the inline budget.
    async fn capture(
        &self,
        raw: String,
        ctx: &ToolContext,
    ) -> ToolResult<(String, Vec<Artifact>)> {
        let redacted = ctx
            .guard
            .guard_outbound(&raw)
            .map_err(|e| ToolError::PolicyViolation(e.to_string()))?;

        if redacted.len() <= ctx.output_cap {
            return Ok((redacted, Vec::new()));
        }

        let artifact_id = Uuid::new_v4();
        tokio::fs::create_dir_all(&ctx.media_dir).await?;
        let path = ctx.media_dir.join(artifact_id.to_string());
        tokio::fs::write(&path, redacted.as_bytes()).await?;

        let mut artifact = Artifact::new(
            "spilled tool output",
            "text/plain",
            redacted.len() as u64,
        );
        artifact.id = artifact_id;

        let cut = floor_char_boundary(&redacted, ctx.output_cap);
        let inline = format!(
            "{}\n{}{}]",
            &redacted[..cut],
            TRUNCATION_SENTINEL,
            artifact_id
        );
        debug!(artifact = %artifact_id, bytes = redacted.len(), "Output spilled to artifact");
        Ok((inline, vec![artifact]))
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Shape a pipeline error into the transcript-facing result structure.
#[must_use]
pub fn error_output(error: &ToolError, duration: std::time::Duration) -> ToolOutput {
    ToolOutput::err(error.to_string(), duration)
}

/// Largest index `<= cap` that sits on a char boundary.
fn floor_char_boundary(text: &str, cap: usize) -> usize {
    let mut cut = cap.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut = cut.saturating_sub(1);
    }
    cut
}

/// Check the `required` list of a JSON-schema object declaration.
fn validate_required(schema: &Value, args: &Value) -> ToolResult<()> {
    let is_object_schema = schema.get("type").and_then(Value::as_str) == Some("object");
    if !is_object_schema {
        return Ok(());
    }
    let Some(object) = args.as_object() else {
        return Err(ToolError::InvalidArgs("arguments must be an object".into()));
    };
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                return Err(ToolError::InvalidArgs(format!(
                    "missing required field '{field}'"
                )));
            }
        }
    }
    Ok(())
}

/// Walk the arguments, expanding `{{name}}` in every string through the
/// vault. In lax mode unresolved placeholders pass through untouched; in
/// strict mode they fail the call.
fn expand_secrets(args: &Value, ctx: &ToolContext) -> ToolResult<Value> {
    Ok(match args {
        Value::String(s) => match ctx.vault.materialize(s) {
            Ok(expanded) => Value::String(expanded),
            Err(VaultError::MissingSecret { name }) => {
                if ctx.guard.is_strict() {
                    return Err(ToolError::Vault(VaultError::MissingSecret { name }));
                }
                Value::String(s.clone())
            },
            Err(e) => return Err(ToolError::Vault(e)),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| expand_secrets(item, ctx))
                .collect::<ToolResult<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), expand_secrets(value, ctx)?);
            }
            Value::Object(out)
        },
        other => other.clone(),
    })
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::context::ToolContext;
    use crate::net::{NetworkPolicy, SsrfGuard};
    use crate::registry::{Tool, ToolOutcome, ToolRegistry, ToolSpec};
    use async_trait::async_trait;
    use itak_core::{CostClass, Principal, Role, RoomType, SessionKey, SideEffectClass};
    use itak_limits::LimiterConfig;
    use itak_llm::{ModelBinding, ModelRole, ModelRouter, ScriptedProvider};
    use itak_memory::{MemoryConfig, MemoryFabric};
    use itak_store::{MemGraphStore, MemRelationalStore, MemVectorStore};
    use itak_vault::{OutputGuard, SecretVault};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct EchoTool {
        spec: ToolSpec,
        invoked: Arc<AtomicBool>,
        output: String,
    }

    impl EchoTool {
        fn new(required_role: Role, output: impl Into<String>) -> (Arc<Self>, Arc<AtomicBool>) {
            let invoked = Arc::new(AtomicBool::new(false));
            let tool = Arc::new(Self {
                spec: ToolSpec {
                    name: "echo",
                    description: "test echo",
                    usage_prompt: "echoes",
                    input_schema: serde_json::json!({
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
                    }),
                    required_role,
                    side_effect: SideEffectClass::None,
                    timeout: Duration::from_secs(5),
                    cost_class: CostClass::Free,
                },
                invoked: Arc::clone(&invoked),
                output: output.into(),
            });
            (tool, invoked)
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> crate::ToolResult<ToolOutcome> {
            self.invoked.store(true, Ordering::Release);
            if self.output.is_empty() {
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                Ok(ToolOutcome::text(text))
            } else {
                Ok(ToolOutcome::text(self.output.clone()))
            }
        }
    }

    fn fabric() -> MemoryFabric {
        let provider = Arc::new(ScriptedProvider::new("scripted", vec![]));
        let router = ModelRouter::builder()
            .provider(provider)
            .role(
                ModelRole::Embedding,
                vec![ModelBinding::new("scripted", "embedder").free_model()],
            )
            .build(Arc::new(RateLimiter::new(LimiterConfig::default())));
        MemoryFabric::new(
            Arc::new(MemRelationalStore::new()),
            Arc::new(MemGraphStore::new()),
            Arc::new(MemVectorStore::new()),
            router,
            MemoryConfig {
                model_extraction: false,
                ..MemoryConfig::default()
            },
            None,
        )
    }

    fn context(dir: &tempfile::TempDir, role: Role, vault: Arc<SecretVault>) -> ToolContext {
        let guard = OutputGuard::new(Arc::clone(&vault));
        ToolContext::new(
            Principal::new("tester", role),
            SessionKey::new("cli", RoomType::Direct, "test"),
            dir.path().join("work"),
            dir.path().join("media"),
            vault,
            guard,
            fabric(),
            Arc::new(MemGraphStore::new()),
            SsrfGuard::new(NetworkPolicy::open()),
        )
    }

    fn executor(tool: Arc<dyn Tool>) -> ToolExecutor {
        ToolExecutor::new(
            Arc::new(ToolRegistry::new().register(tool)),
            Arc::new(itak_hooks::HookRunner::empty()),
            Arc::new(RateLimiter::new(LimiterConfig::default())),
        )
    }

    use itak_limits::RateLimiter;

    #[tokio::test]
    async fn permission_denied_never_invokes_the_body() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, invoked) = EchoTool::new(Role::Owner, "");
        let executor = executor(tool);
        let ctx = context(&dir, Role::User, Arc::new(SecretVault::new()));

        let err = executor
            .dispatch(
                "echo",
                serde_json::json!({"text": "hi"}),
                &ctx,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
        assert!(!invoked.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn secrets_expand_in_and_redact_out() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(SecretVault::new());
        vault.put("api_key", "sk-super-secret-value");

        let (tool, _) = EchoTool::new(Role::User, "");
        let executor = executor(tool);
        let ctx = context(&dir, Role::User, vault);

        let output = executor
            .dispatch(
                "echo",
                serde_json::json!({"text": "key is {{api_key}}"}),
                &ctx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // The body saw the expanded value; the captured result must not.
        assert!(!output.content.contains("sk-super-secret-value"));
        assert!(output.content.contains(itak_vault::MASK));
    }

    #[tokio::test]
    async fn oversized_output_spills_to_an_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let big = "lorem ipsum dolor sit amet ".repeat(4000);
        let (tool, _) = EchoTool::new(Role::User, big.clone());
        let executor = executor(tool);
        let ctx = context(&dir, Role::User, Arc::new(SecretVault::new()));

        let output = executor
            .dispatch(
                "echo",
                serde_json::json!({"text": "ignored"}),
                &ctx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.artifacts.len(), 1);
        assert!(output.content.len() < big.len());
        assert!(output.content.contains("[output truncated"));
        let spilled = dir.path().join("media").join(output.artifacts[0].id.to_string());
        assert_eq!(std::fs::read_to_string(spilled).unwrap(), big);
    }

    #[tokio::test]
    async fn unknown_tool_and_missing_args_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, invoked) = EchoTool::new(Role::User, "");
        let executor = executor(tool);
        let ctx = context(&dir, Role::User, Arc::new(SecretVault::new()));
        let cancel = CancellationToken::new();

        assert!(matches!(
            executor
                .dispatch("nope", serde_json::json!({}), &ctx, &cancel)
                .await
                .unwrap_err(),
            ToolError::UnknownTool(_)
        ));
        assert!(matches!(
            executor
                .dispatch("echo", serde_json::json!({}), &ctx, &cancel)
                .await
                .unwrap_err(),
            ToolError::InvalidArgs(_)
        ));
        assert!(!invoked.load(Ordering::Acquire));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_fields_are_enforced() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "required": ["q"]
        });
        assert!(validate_required(&schema, &serde_json::json!({"q": "x"})).is_ok());
        assert!(matches!(
            validate_required(&schema, &serde_json::json!({})),
            Err(ToolError::InvalidArgs(_))
        ));
        assert!(matches!(
            validate_required(&schema, &serde_json::json!("not an object")),
            Err(ToolError::InvalidArgs(_))
        ));
    }

    #[test]
    fn char_boundary_floor_is_safe() {
        let text = "héllo wörld";
        for cap in 0..=text.len() {
            let cut = floor_char_boundary(text, cap);
            assert!(text.is_char_boundary(cut));
        }
    }
}
