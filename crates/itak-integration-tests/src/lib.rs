//! Shared harness for the end-to-end scenario tests.

#![deny(unsafe_code)]
#![deny(clippy::all)]

use async_trait::async_trait;
use itak_checkpoint::CheckpointStore;
use itak_heal::{HealConfig, HealingEngine};
use itak_hooks::HookRunner;
use itak_limits::{LimiterConfig, RateLimiter};
use itak_llm::{
    ChatRequest, LlmResponse, LlmResult, ModelBinding, ModelRole, ModelRouter, Provider,
    ScriptedAction, ScriptedProvider, StreamBox, TokenEstimate, Usage,
};
use itak_memory::{MemoryConfig, MemoryFabric};
use itak_runtime::{AgentRuntime, RuntimeConfig, RuntimeServices, SessionStore, SubAgentProfile};
use itak_store::{GraphStore, MemGraphStore, MemRelationalStore, MemTaskStore, MemVectorStore};
use itak_tools::{
    BrowserTool, DelegateTool, MemoryForgetTool, MemoryLoadTool, MemorySaveTool, NetworkPolicy,
    ResponseTool, SsrfGuard, ToolExecutor, ToolRegistry,
};
use itak_vault::{OutputGuard, SecretVault};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A provider that answers with a fixed response after a delay chosen by
/// prompt content: prompts containing `fast` answer quickly, everything
/// else sleeps. Counts completed calls so tests can assert that losing
/// swarm peers were abandoned.
pub struct DelayedProvider {
    name: String,
    completed: AtomicUsize,
}

impl DelayedProvider {
    /// Create a delayed provider.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            completed: AtomicUsize::new(0),
        }
    }

    /// How many calls ran to completion.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    fn response_for(request: &ChatRequest) -> String {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let marker = if prompt.contains("fast") { "fast" } else { "slow" };
        serde_json::json!({
            "tool": "response",
            "args": {"text": format!("{marker} result")}
        })
        .to_string()
    }

    fn delay_for(request: &ChatRequest) -> Duration {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if prompt.contains("fast") {
            Duration::from_millis(50)
        } else {
            Duration::from_secs(5)
        }
    }
}

#[async_trait]
impl Provider for DelayedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, model: &str, request: &ChatRequest) -> LlmResult<StreamBox> {
        let response = self.complete(model, request).await?;
        let events = vec![
            Ok(itak_llm::ProviderEvent::Delta(response.text)),
            Ok(itak_llm::ProviderEvent::Done(response.usage)),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn complete(&self, model: &str, request: &ChatRequest) -> LlmResult<LlmResponse> {
        tokio::time::sleep(Self::delay_for(request)).await;
        self.completed.fetch_add(1, Ordering::AcqRel);
        Ok(LlmResponse {
            text: Self::response_for(request),
            usage: Usage {
                tokens_in: 10,
                tokens_out: 10,
                approximate: true,
            },
            cost_usd: 0.0,
            provider: self.name.clone(),
            model: model.to_string(),
        })
    }

    async fn embed(&self, _model: &str, texts: &[String]) -> LlmResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| itak_llm::deterministic_embedding(t))
            .collect())
    }

    fn count_tokens(&self, _model: &str, text: &str) -> TokenEstimate {
        TokenEstimate::approximate_for(text)
    }
}

/// Options for building a scenario harness.
pub struct HarnessBuilder {
    chat_script: Vec<ScriptedAction>,
    chat_bindings: Option<Vec<ModelBinding>>,
    extra_providers: Vec<Arc<dyn Provider>>,
    utility_bindings: Option<Vec<ModelBinding>>,
    limiter_config: LimiterConfig,
    secrets: Vec<(String, String)>,
    profiles: Vec<SubAgentProfile>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessBuilder {
    /// Start with defaults: a free scripted chat provider, no budgets.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chat_script: Vec::new(),
            chat_bindings: None,
            extra_providers: Vec::new(),
            utility_bindings: None,
            limiter_config: LimiterConfig::default(),
            secrets: Vec::new(),
            profiles: vec![SubAgentProfile::researcher()],
        }
    }

    /// Set the chat script.
    #[must_use]
    pub fn chat_script(mut self, script: Vec<ScriptedAction>) -> Self {
        self.chat_script = script;
        self
    }

    /// Override the chat fallback list.
    #[must_use]
    pub fn chat_bindings(mut self, bindings: Vec<ModelBinding>) -> Self {
        self.chat_bindings = Some(bindings);
        self
    }

    /// Register an extra provider.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.extra_providers.push(provider);
        self
    }

    /// Override the utility fallback list.
    #[must_use]
    pub fn utility_bindings(mut self, bindings: Vec<ModelBinding>) -> Self {
        self.utility_bindings = Some(bindings);
        self
    }

    /// Set the limiter configuration.
    #[must_use]
    pub fn limits(mut self, config: LimiterConfig) -> Self {
        self.limiter_config = config;
        self
    }

    /// Put a secret in the vault.
    #[must_use]
    pub fn secret(mut self, name: &str, value: &str) -> Self {
        self.secrets.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace the sub-agent profiles.
    #[must_use]
    pub fn profiles(mut self, profiles: Vec<SubAgentProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Build the harness.
    #[must_use]
    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let limiter = Arc::new(RateLimiter::new(self.limiter_config));

        let chat_provider = Arc::new(ScriptedProvider::new("scripted", self.chat_script));
        let mut builder = ModelRouter::builder().provider(Arc::clone(&chat_provider) as Arc<dyn Provider>);
        for provider in self.extra_providers {
            builder = builder.provider(provider);
        }
        let chat_bindings = self
            .chat_bindings
            .unwrap_or_else(|| vec![ModelBinding::new("scripted", "chat").free_model()]);
        let utility_bindings = self
            .utility_bindings
            .unwrap_or_else(|| vec![ModelBinding::new("scripted", "utility").free_model()]);
        let router = builder
            .role(ModelRole::Chat, chat_bindings)
            .role(ModelRole::Utility, utility_bindings)
            .role(
                ModelRole::Embedding,
                vec![ModelBinding::new("scripted", "embedder").free_model()],
            )
            .build(Arc::clone(&limiter));

        let vault = Arc::new(SecretVault::new());
        for (name, value) in &self.secrets {
            vault.put(name, value);
        }
        let guard = OutputGuard::new(Arc::clone(&vault));

        let graph: Arc<dyn GraphStore> = Arc::new(MemGraphStore::new());
        let fabric = MemoryFabric::new(
            Arc::new(MemRelationalStore::new()),
            Arc::clone(&graph),
            Arc::new(MemVectorStore::new()),
            router.clone(),
            MemoryConfig {
                model_extraction: false,
                ..MemoryConfig::default()
            },
            None,
        );

        let registry = ToolRegistry::new()
            .register(Arc::new(ResponseTool))
            .register(Arc::new(MemorySaveTool))
            .register(Arc::new(MemoryLoadTool))
            .register(Arc::new(MemoryForgetTool))
            .register(Arc::new(DelegateTool))
            .register(Arc::new(BrowserTool));
        let hooks = Arc::new(HookRunner::empty());
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            Arc::clone(&hooks),
            Arc::clone(&limiter),
        ));
        let healer = Arc::new(HealingEngine::new(
            fabric.clone(),
            router.clone(),
            HealConfig::default(),
        ));

        let services = RuntimeServices {
            fabric: fabric.clone(),
            router,
            executor,
            healer,
            checkpoints: Arc::new(CheckpointStore::new(
                dir.path().join("sessions"),
                Duration::ZERO,
            )),
            hooks,
            sessions: Arc::new(SessionStore::new(dir.path().join("sessions"))),
            vault: Arc::clone(&vault),
            guard,
            graph,
            tasks: Arc::new(MemTaskStore::new()),
            ssrf: SsrfGuard::new(NetworkPolicy::open()),
            work_root: dir.path().join("work"),
        };
        let runtime = AgentRuntime::new_arc(services, RuntimeConfig::default(), self.profiles);

        Harness {
            runtime,
            fabric,
            limiter,
            vault,
            chat_provider,
            dir,
        }
    }
}

/// A fully wired in-memory runtime for one scenario.
pub struct Harness {
    /// The runtime under test.
    pub runtime: Arc<AgentRuntime>,
    /// The fabric, for direct assertions.
    pub fabric: MemoryFabric,
    /// The limiter, for counter assertions.
    pub limiter: Arc<RateLimiter>,
    /// The vault.
    pub vault: Arc<SecretVault>,
    /// The scripted chat provider, for call-count assertions.
    pub chat_provider: Arc<ScriptedProvider>,
    /// Keeps the data directory alive.
    pub dir: tempfile::TempDir,
}

/// Helper: a `{"tool": ..., "args": ...}` intent string.
#[must_use]
pub fn tool_json(name: &str, args: serde_json::Value) -> String {
    serde_json::json!({"tool": name, "args": args}).to_string()
}

/// Helper: a terminal response intent string.
#[must_use]
pub fn response_json(text: &str) -> String {
    tool_json("response", serde_json::json!({"text": text}))
}
