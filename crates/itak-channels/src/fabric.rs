//! The adapter fabric: identity resolution, inbound routing, outbound
//! delivery.

use itak_core::{Principal, SessionKey};
use itak_runtime::{AgentRuntime, InboundMessage, ProgressEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapter::{ChannelAdapter, InboundEnvelope};
use crate::error::{ChannelError, ChannelResult};
use crate::media::MediaPipeline;

/// Maps `(channel, external_id)` to a principal. The config crate's
/// principal registry implements this; tests use closures.
pub trait PrincipalResolver: Send + Sync {
    /// Resolve an external identity.
    fn resolve(&self, channel: &str, external_id: &str) -> Option<Principal>;
}

impl<F> PrincipalResolver for F
where
    F: Fn(&str, &str) -> Option<Principal> + Send + Sync,
{
    fn resolve(&self, channel: &str, external_id: &str) -> Option<Principal> {
        self(channel, external_id)
    }
}

/// Runs every adapter, routes inbound messages to the runtime, and fans
/// progress back out.
pub struct AdapterFabric {
    runtime: Arc<AgentRuntime>,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    resolver: Arc<dyn PrincipalResolver>,
    media: MediaPipeline,
}

impl AdapterFabric {
    /// Create a fabric over the runtime.
    #[must_use]
    pub fn new(
        runtime: Arc<AgentRuntime>,
        resolver: Arc<dyn PrincipalResolver>,
        media: MediaPipeline,
    ) -> Self {
        Self {
            runtime,
            adapters: HashMap::new(),
            resolver,
            media,
        }
    }

    /// Register an adapter under its channel name.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel().to_string(), adapter);
        self
    }

    /// Start every adapter and the outbound router task.
    ///
    /// # Errors
    ///
    /// Propagates the first adapter whose `start` fails.
    pub async fn start(self: &Arc<Self>) -> ChannelResult<()> {
        for adapter in self.adapters.values() {
            adapter.start().await?;
            info!(channel = adapter.channel(), "Adapter started");
        }
        let fabric = Arc::clone(self);
        tokio::spawn(async move { fabric.route_outbound().await });
        Ok(())
    }

    /// Stop every adapter. Idempotent.
    pub async fn stop(&self) {
        for adapter in self.adapters.values() {
            if let Err(e) = adapter.stop().await {
                warn!(channel = adapter.channel(), error = %e, "Adapter stop failed");
            }
        }
    }

    /// Handle one inbound message from an adapter: resolve the principal,
    /// run media, enqueue on the session FIFO.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::UnknownIdentity`] when no principal is bound.
    /// - [`ChannelError::Runtime`] with a queue-full error; the caller
    ///   should reply with a busy notice.
    pub async fn handle_inbound(
        &self,
        channel: &str,
        envelope: InboundEnvelope,
    ) -> ChannelResult<SessionKey> {
        let Some(principal) = self.resolver.resolve(channel, &envelope.external_user_id) else {
            return Err(ChannelError::UnknownIdentity {
                channel: channel.to_string(),
                external_id: envelope.external_user_id,
            });
        };

        let key = SessionKey::new(channel, envelope.room_type, &envelope.room_id);
        debug!(session = %key, principal = %principal.id, "Inbound message");

        let mut content = envelope.content.clone();
        for attachment in &envelope.attachments {
            match self.media.ingest(&key, principal.id, attachment).await {
                Ok((description, _artifact)) => {
                    content.push_str("\n\n");
                    content.push_str(&description);
                },
                Err(e) => {
                    warn!(error = %e, "Attachment ingestion failed");
                    content.push_str(&format!(
                        "\n\n[attachment '{}' could not be processed]",
                        attachment.filename
                    ));
                },
            }
        }

        self.runtime.enqueue_message(InboundMessage {
            session_key: key.clone(),
            principal,
            content,
        })?;
        Ok(key)
    }

    /// Fan runtime progress out to the owning adapters. Runs until the
    /// runtime drops its progress bus.
    async fn route_outbound(&self) {
        let mut events = self.runtime.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Outbound router lagged");
                    continue;
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let session = event.session().clone();
            let Some(adapter) = self.adapters.get(session.channel()) else {
                continue;
            };

            match event {
                ProgressEvent::Final { text, .. } => {
                    if let Err(e) = adapter.send(&session, &text).await {
                        warn!(session = %session, error = %e, "Final delivery failed");
                    }
                },
                ProgressEvent::Presence { state, .. } => {
                    adapter.set_presence(&session, state, "").await;
                },
                ProgressEvent::StepStart { description, .. } => {
                    if adapter.supports_edit() {
                        let _ = adapter
                            .edit_last(&session, &format!("⏳ {description}"))
                            .await;
                    }
                },
                ProgressEvent::StepEnd { summary, ok, .. } => {
                    if adapter.supports_edit() {
                        let marker = if ok { "✓" } else { "✗" };
                        let _ = adapter
                            .edit_last(&session, &format!("{marker} {summary}"))
                            .await;
                    }
                },
                ProgressEvent::Plan { .. } | ProgressEvent::Error { .. } => {},
            }
        }
    }
}

impl std::fmt::Debug for AdapterFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterFabric")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Attachment, AttachmentSource, ChannelAdapter, InboundEnvelope};
    use crate::media::MediaPipeline;
    use async_trait::async_trait;
    use itak_checkpoint::CheckpointStore;
    use itak_core::{Role, RoomType};
    use itak_heal::{HealConfig, HealingEngine};
    use itak_hooks::HookRunner;
    use itak_limits::{LimiterConfig, RateLimiter};
    use itak_llm::{ModelBinding, ModelRole, ModelRouter, ScriptedAction, ScriptedProvider};
    use itak_memory::{MemoryConfig, MemoryFabric};
    use itak_runtime::{AgentRuntime, RuntimeConfig, RuntimeServices, SessionStore};
    use itak_store::{MemGraphStore, MemRelationalStore, MemTaskStore, MemVectorStore};
    use itak_tools::{NetworkPolicy, ResponseTool, SsrfGuard, ToolExecutor, ToolRegistry};
    use itak_vault::{OutputGuard, SecretVault};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingAdapter {
        sends: std::sync::Mutex<Vec<(SessionKey, String)>>,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn channel(&self) -> &str {
            "mock"
        }

        async fn start(&self) -> crate::ChannelResult<()> {
            Ok(())
        }

        async fn stop(&self) -> crate::ChannelResult<()> {
            Ok(())
        }

        async fn send(&self, session: &SessionKey, content: &str) -> crate::ChannelResult<()> {
            self.sends
                .lock()
                .expect("sends lock")
                .push((session.clone(), content.to_string()));
            Ok(())
        }
    }

    fn runtime(script: Vec<ScriptedAction>, dir: &tempfile::TempDir) -> Arc<AgentRuntime> {
        let limiter = Arc::new(RateLimiter::new(LimiterConfig::default()));
        let router = ModelRouter::builder()
            .provider(Arc::new(ScriptedProvider::new("scripted", script)))
            .role(
                ModelRole::Chat,
                vec![ModelBinding::new("scripted", "chat").free_model()],
            )
            .role(
                ModelRole::Utility,
                vec![ModelBinding::new("scripted", "utility").free_model()],
            )
            .role(
                ModelRole::Embedding,
                vec![ModelBinding::new("scripted", "embedder").free_model()],
            )
            .build(Arc::clone(&limiter));

        let graph: Arc<dyn itak_store::GraphStore> = Arc::new(MemGraphStore::new());
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
        let hooks = Arc::new(HookRunner::empty());
        let vault = Arc::new(SecretVault::new());
        let services = RuntimeServices {
            fabric: fabric.clone(),
            router,
            executor: Arc::new(ToolExecutor::new(
                Arc::new(ToolRegistry::new().register(Arc::new(ResponseTool))),
                Arc::clone(&hooks),
                Arc::clone(&limiter),
            )),
            healer: Arc::new(HealingEngine::new(
                fabric.clone(),
                ModelRouter::builder().build(Arc::clone(&limiter)),
                HealConfig::default(),
            )),
            checkpoints: Arc::new(CheckpointStore::new(
                dir.path().join("sessions"),
                Duration::ZERO,
            )),
            hooks,
            sessions: Arc::new(SessionStore::new(dir.path().join("sessions"))),
            vault: Arc::clone(&vault),
            guard: OutputGuard::new(vault),
            graph,
            tasks: Arc::new(MemTaskStore::new()),
            ssrf: SsrfGuard::new(NetworkPolicy::open()),
            work_root: dir.path().join("work"),
        };
        AgentRuntime::new_arc(services, RuntimeConfig::default(), Vec::new())
    }

    fn resolver() -> Arc<dyn PrincipalResolver> {
        let bound = Principal::new("tester", Role::User).with_binding("mock", "ext1");
        Arc::new(move |channel: &str, external: &str| {
            bound.is_bound(channel, external).then(|| bound.clone())
        })
    }

    fn envelope(content: &str) -> InboundEnvelope {
        InboundEnvelope {
            external_user_id: "ext1".to_string(),
            room_type: RoomType::Direct,
            room_id: "room7".to_string(),
            content: content.to_string(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inbound_flows_to_runtime_and_final_flows_back() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(
            vec![ScriptedAction::Complete(
                serde_json::json!({"tool": "response", "args": {"text": "hi from itak"}})
                    .to_string(),
            )],
            &dir,
        );
        let adapter = Arc::new(RecordingAdapter::default());
        let fabric = Arc::new(
            AdapterFabric::new(
                Arc::clone(&runtime),
                resolver(),
                MediaPipeline::new(
                runtime.services().router.clone(),
                dir.path().join("sessions"),
                SsrfGuard::new(NetworkPolicy::open()),
            ),
            )
            .with_adapter(Arc::clone(&adapter) as Arc<dyn ChannelAdapter>),
        );
        fabric.start().await.unwrap();

        let key = fabric.handle_inbound("mock", envelope("hello")).await.unwrap();
        assert_eq!(key, SessionKey::new("mock", RoomType::Direct, "room7"));

        // The final response routes back through the owning adapter.
        for _ in 0..100 {
            if !adapter.sends.lock().expect("sends lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let sends = adapter.sends.lock().expect("sends lock");
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, key);
        assert_eq!(sends[0].1, "hi from itak");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unbound_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(Vec::new(), &dir);
        let fabric = AdapterFabric::new(
            Arc::clone(&runtime),
            resolver(),
            MediaPipeline::new(
                runtime.services().router.clone(),
                dir.path().join("sessions"),
                SsrfGuard::new(NetworkPolicy::open()),
            ),
        );

        let mut stranger = envelope("hello");
        stranger.external_user_id = "nobody".to_string();
        let err = fabric.handle_inbound("mock", stranger).await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownIdentity { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inline_document_attachment_enters_the_content() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(
            vec![ScriptedAction::Complete(
                serde_json::json!({"tool": "response", "args": {"text": "read it"}}).to_string(),
            )],
            &dir,
        );
        let fabric = AdapterFabric::new(
            Arc::clone(&runtime),
            resolver(),
            MediaPipeline::new(
                runtime.services().router.clone(),
                dir.path().join("sessions"),
                SsrfGuard::new(NetworkPolicy::open()),
            ),
        );

        let mut with_doc = envelope("see attachment");
        with_doc.attachments.push(Attachment {
            filename: "notes.md".to_string(),
            mime: Some("text/markdown".to_string()),
            source: AttachmentSource::Bytes(b"the port is 48920".to_vec()),
        });
        let key = fabric.handle_inbound("mock", with_doc).await.unwrap();

        // The described attachment landed in the session's first turn.
        let mut found = false;
        for _ in 0..100 {
            if let Some(session) = runtime.services().sessions.get(&key) {
                let session = session.lock().await;
                if session
                    .transcript
                    .first()
                    .is_some_and(|t| t.content.contains("48920"))
                {
                    found = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found, "attachment text never reached the transcript");
    }
}
