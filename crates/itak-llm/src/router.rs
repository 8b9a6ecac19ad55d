//! Role-ordered fallback dispatch.

use futures::StreamExt;
use itak_core::PrincipalId;
use itak_limits::{RateLimiter, ReserveRequest};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{LlmError, LlmResult};
use crate::provider::{Provider, ProviderEvent};
use crate::types::{
    ChatRequest, LlmResponse, ModelBinding, ModelRole, StreamEvent, TokenEstimate,
};

/// A routed stream: [`StreamEvent`]s, or a terminal error.
pub type RoutedStream = Pin<Box<dyn futures::Stream<Item = LlmResult<StreamEvent>> + Send>>;

struct RouterInner {
    roles: HashMap<ModelRole, Vec<ModelBinding>>,
    providers: HashMap<String, Arc<dyn Provider>>,
    limiter: Arc<RateLimiter>,
    /// Idle deadline between stream chunks and cap on non-streaming calls.
    attempt_timeout: Duration,
}

/// Builder for [`ModelRouter`].
pub struct RouterBuilder {
    roles: HashMap<ModelRole, Vec<ModelBinding>>,
    providers: HashMap<String, Arc<dyn Provider>>,
    attempt_timeout: Duration,
}

impl RouterBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            roles: HashMap::new(),
            providers: HashMap::new(),
            attempt_timeout: Duration::from_secs(120),
        }
    }

    /// Register a provider implementation.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// Set a role's ordered fallback list.
    #[must_use]
    pub fn role(mut self, role: ModelRole, bindings: Vec<ModelBinding>) -> Self {
        self.roles.insert(role, bindings);
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Build the router.
    #[must_use]
    pub fn build(self, limiter: Arc<RateLimiter>) -> ModelRouter {
        ModelRouter {
            inner: Arc::new(RouterInner {
                roles: self.roles,
                providers: self.providers,
                limiter,
                attempt_timeout: self.attempt_timeout,
            }),
        }
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches model calls across each role's fallback list.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ModelRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("roles", &self.inner.roles.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ModelRouter {
    /// Start building a router.
    #[must_use]
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// The context window of the role's primary binding.
    #[must_use]
    pub fn context_window(&self, role: ModelRole) -> usize {
        self.inner
            .roles
            .get(&role)
            .and_then(|b| b.first())
            .map_or(32_768, |b| b.context_window)
    }

    /// Tokens the scheduler may fill with history for this role.
    #[must_use]
    pub fn history_budget(&self, role: ModelRole) -> usize {
        self.inner
            .roles
            .get(&role)
            .and_then(|b| b.first())
            .map_or(16_384, |b| {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    (b.context_window as f32 * b.history_fraction.clamp(0.05, 0.95)) as usize
                }
            })
    }

    /// Token estimate for `text` under the role's primary binding.
    #[must_use]
    pub fn estimate_tokens(&self, role: ModelRole, text: &str) -> TokenEstimate {
        let inner = &self.inner;
        inner
            .roles
            .get(&role)
            .and_then(|b| b.first())
            .and_then(|b| inner.providers.get(&b.provider).map(|p| (p, b)))
            .map_or_else(
                || TokenEstimate::approximate_for(text),
                |(p, b)| p.count_tokens(&b.model, text),
            )
    }

    fn bindings(&self, role: ModelRole) -> LlmResult<&[ModelBinding]> {
        self.inner
            .roles
            .get(&role)
            .map(Vec::as_slice)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| LlmError::NoBindings(role.to_string()))
    }

    /// Complete without streaming, falling back across bindings.
    ///
    /// # Errors
    ///
    /// - [`LlmError::Unavailable`] when the limiter denies (lockout or hard
    ///   budget); no further binding is tried.
    /// - [`LlmError::NonTransient`] propagated from the first binding that
    ///   failed non-transiently.
    /// - [`LlmError::Exhausted`] when every binding failed transiently.
    pub async fn complete(
        &self,
        role: ModelRole,
        principal: PrincipalId,
        request: &ChatRequest,
    ) -> LlmResult<LlmResponse> {
        let bindings = self.bindings(role)?;
        let inner = &self.inner;
        let mut last = String::from("no attempt made");
        let mut attempts = 0usize;

        for binding in bindings {
            let Some(provider) = inner.providers.get(&binding.provider) else {
                warn!(provider = %binding.provider, "No provider registered for binding");
                continue;
            };
            attempts = attempts.saturating_add(1);

            let prompt_tokens = request.prompt_chars().div_ceil(4);
            let estimate = binding.estimate_usd(prompt_tokens, request.max_tokens);
            let mut reserve = ReserveRequest::new(principal, estimate).for_tool(role.bucket());
            if binding.free {
                reserve = reserve.free();
            }
            let reservation = inner.limiter.reserve(&reserve)?;

            let attempt = tokio::time::timeout(
                inner.attempt_timeout,
                provider.complete(&binding.model, request),
            )
            .await
            .unwrap_or(Err(LlmError::Timeout(inner.attempt_timeout)));

            match attempt {
                Ok(mut response) => {
                    let cost = binding.actual_usd(response.usage.tokens_in, response.usage.tokens_out);
                    inner.limiter.commit(
                        reservation,
                        cost,
                        response.usage.tokens_in as u64,
                        response.usage.tokens_out as u64,
                    );
                    response.cost_usd = cost;
                    response.provider = binding.provider.clone();
                    response.model = binding.model.clone();
                    debug!(role = %role, provider = %binding.provider, cost_usd = cost, "Dispatch served");
                    return Ok(response);
                },
                Err(e) if e.is_transient() => {
                    inner.limiter.rollback(reservation);
                    warn!(role = %role, provider = %binding.provider, error = %e, "Transient failure, falling back");
                    last = e.to_string();
                },
                Err(e) => {
                    inner.limiter.rollback(reservation);
                    return Err(e);
                },
            }
        }
        Err(LlmError::Exhausted { attempts, last })
    }

    /// Stream a completion, falling back across bindings.
    ///
    /// Each attempt is announced with [`StreamEvent::Started`]; on a
    /// mid-stream transient failure the router silently moves to the next
    /// binding and announces it again, so accumulators must reset on
    /// `Started`. Chunk order within one attempt is provider order.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`LlmError::NoBindings`] for an unconfigured
    /// role; later failures arrive as items on the stream.
    pub fn stream(
        &self,
        role: ModelRole,
        principal: PrincipalId,
        request: ChatRequest,
    ) -> LlmResult<RoutedStream> {
        self.bindings(role)?;
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel::<LlmResult<StreamEvent>>(64);

        tokio::spawn(async move {
            drive_stream(inner, role, principal, request, tx).await;
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    /// Embed a batch of texts through the embedding role.
    ///
    /// # Errors
    ///
    /// Same error surface as [`complete`](Self::complete).
    pub async fn embed(
        &self,
        principal: PrincipalId,
        texts: &[String],
    ) -> LlmResult<Vec<Vec<f32>>> {
        let bindings = self.bindings(ModelRole::Embedding)?;
        let inner = &self.inner;
        let mut last = String::from("no attempt made");
        let mut attempts = 0usize;

        let total_chars: usize = texts.iter().map(String::len).sum();
        let prompt_tokens = total_chars.div_ceil(4);

        for binding in bindings {
            let Some(provider) = inner.providers.get(&binding.provider) else {
                warn!(provider = %binding.provider, "No provider registered for binding");
                continue;
            };
            attempts = attempts.saturating_add(1);

            let estimate = binding.estimate_usd(prompt_tokens, 0);
            let mut reserve =
                ReserveRequest::new(principal, estimate).for_tool(ModelRole::Embedding.bucket());
            if binding.free {
                reserve = reserve.free();
            }
            let reservation = inner.limiter.reserve(&reserve)?;

            match provider.embed(&binding.model, texts).await {
                Ok(vectors) => {
                    let cost = binding.actual_usd(prompt_tokens, 0);
                    inner
                        .limiter
                        .commit(reservation, cost, prompt_tokens as u64, 0);
                    return Ok(vectors);
                },
                Err(e) if e.is_transient() => {
                    inner.limiter.rollback(reservation);
                    last = e.to_string();
                },
                Err(e) => {
                    inner.limiter.rollback(reservation);
                    return Err(e);
                },
            }
        }
        Err(LlmError::Exhausted { attempts, last })
    }

    /// Accumulate a routed stream into a full response, resetting on every
    /// `Started` event so fallback attempts never mix.
    ///
    /// # Errors
    ///
    /// Propagates the stream's terminal error.
    pub async fn accumulate(mut stream: RoutedStream) -> LlmResult<LlmResponse> {
        let mut text = String::new();
        let mut provider = String::new();
        let mut model = String::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Started {
                    provider: p,
                    model: m,
                } => {
                    text.clear();
                    provider = p;
                    model = m;
                },
                StreamEvent::Delta(delta) => text.push_str(&delta),
                StreamEvent::Done { usage, cost_usd } => {
                    return Ok(LlmResponse {
                        text,
                        usage,
                        cost_usd,
                        provider,
                        model,
                    });
                },
            }
        }
        Err(LlmError::Transient("stream ended without completion".into()))
    }
}

#[allow(clippy::too_many_lines)]
async fn drive_stream(
    inner: Arc<RouterInner>,
    role: ModelRole,
    principal: PrincipalId,
    request: ChatRequest,
    tx: mpsc::Sender<LlmResult<StreamEvent>>,
) {
    let Some(bindings) = inner.roles.get(&role) else {
        let _ = tx.send(Err(LlmError::NoBindings(role.to_string()))).await;
        return;
    };
    let mut last = String::from("no attempt made");
    let mut attempts = 0usize;

    for binding in bindings {
        let Some(provider) = inner.providers.get(&binding.provider) else {
            warn!(provider = %binding.provider, "No provider registered for binding");
            continue;
        };
        attempts = attempts.saturating_add(1);

        let prompt_tokens = request.prompt_chars().div_ceil(4);
        let estimate = binding.estimate_usd(prompt_tokens, request.max_tokens);
        let mut reserve = ReserveRequest::new(principal, estimate).for_tool(role.bucket());
        if binding.free {
            reserve = reserve.free();
        }
        let reservation = match inner.limiter.reserve(&reserve) {
            Ok(r) => r,
            Err(denied) => {
                // Lockout or hard budget: stop, do not try further bindings.
                let _ = tx.send(Err(LlmError::Unavailable(denied))).await;
                return;
            },
        };

        let mut provider_stream = match provider.stream(&binding.model, &request).await {
            Ok(s) => s,
            Err(e) if e.is_transient() => {
                inner.limiter.rollback(reservation);
                last = e.to_string();
                continue;
            },
            Err(e) => {
                inner.limiter.rollback(reservation);
                let _ = tx.send(Err(e)).await;
                return;
            },
        };

        if tx
            .send(Ok(StreamEvent::Started {
                provider: binding.provider.clone(),
                model: binding.model.clone(),
            }))
            .await
            .is_err()
        {
            // Caller went away; release the reservation.
            inner.limiter.rollback(reservation);
            return;
        }

        let mut streamed_chars = 0usize;
        let outcome = loop {
            let next = tokio::time::timeout(inner.attempt_timeout, provider_stream.next()).await;
            match next {
                Err(_) => break Err(LlmError::Timeout(inner.attempt_timeout)),
                Ok(None) => break Err(LlmError::Transient("stream ended without completion".into())),
                Ok(Some(Err(e))) => break Err(e),
                Ok(Some(Ok(ProviderEvent::Delta(delta)))) => {
                    streamed_chars = streamed_chars.saturating_add(delta.len());
                    if tx.send(Ok(StreamEvent::Delta(delta))).await.is_err() {
                        inner.limiter.rollback(reservation);
                        return;
                    }
                },
                Ok(Some(Ok(ProviderEvent::Done(usage)))) => break Ok(usage),
            }
        };

        match outcome {
            Ok(mut usage) => {
                if usage.tokens_out == 0 && streamed_chars > 0 {
                    usage.tokens_out = streamed_chars.div_ceil(4);
                    usage.approximate = true;
                }
                let cost = binding.actual_usd(usage.tokens_in, usage.tokens_out);
                inner.limiter.commit(
                    reservation,
                    cost,
                    usage.tokens_in as u64,
                    usage.tokens_out as u64,
                );
                let _ = tx.send(Ok(StreamEvent::Done { usage, cost_usd: cost })).await;
                return;
            },
            Err(e) if e.is_transient() => {
                inner.limiter.rollback(reservation);
                warn!(role = %role, provider = %binding.provider, error = %e, "Mid-stream transient failure, falling back");
                last = e.to_string();
            },
            Err(e) => {
                inner.limiter.rollback(reservation);
                let _ = tx.send(Err(e)).await;
                return;
            },
        }
    }
    let _ = tx.send(Err(LlmError::Exhausted { attempts, last })).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedAction, ScriptedProvider};
    use crate::types::Message;
    use itak_limits::{LimiterConfig, WindowKind};

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(LimiterConfig::default()))
    }

    fn request() -> ChatRequest {
        ChatRequest::new("you are a test", vec![Message::user("hello")])
    }

    #[tokio::test]
    async fn complete_falls_back_on_transient() {
        let a = Arc::new(ScriptedProvider::new(
            "provider_a",
            vec![ScriptedAction::Transient("503".into())],
        ));
        let b = Arc::new(ScriptedProvider::new(
            "provider_b",
            vec![ScriptedAction::Complete("from b".into())],
        ));
        let router = ModelRouter::builder()
            .provider(a)
            .provider(b)
            .role(
                ModelRole::Chat,
                vec![
                    ModelBinding::new("provider_a", "model_x"),
                    ModelBinding::new("provider_b", "model_y"),
                ],
            )
            .build(limiter());

        let response = router
            .complete(ModelRole::Chat, PrincipalId::new(), &request())
            .await
            .unwrap();
        assert_eq!(response.text, "from b");
        assert_eq!(response.provider, "provider_b");
    }

    #[tokio::test]
    async fn non_transient_short_circuits() {
        let a = Arc::new(ScriptedProvider::new(
            "provider_a",
            vec![ScriptedAction::NonTransient("invalid api key".into())],
        ));
        let b = Arc::new(ScriptedProvider::new("provider_b", vec![]));
        let router = ModelRouter::builder()
            .provider(a)
            .provider(Arc::clone(&b))
            .role(
                ModelRole::Chat,
                vec![
                    ModelBinding::new("provider_a", "model_x"),
                    ModelBinding::new("provider_b", "model_y"),
                ],
            )
            .build(limiter());

        let err = router
            .complete(ModelRole::Chat, PrincipalId::new(), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NonTransient(_)));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn stream_discards_failed_attempt_chunks() {
        // Scenario: provider A dies after two chunks; the accumulated
        // result contains only B's output and only B's cost is committed.
        let a = Arc::new(ScriptedProvider::new(
            "provider_a",
            vec![ScriptedAction::FailMidStream {
                chunks: vec!["par".into(), "tial".into()],
                error: "503 mid-stream".into(),
            }],
        ));
        let b = Arc::new(ScriptedProvider::new(
            "provider_b",
            vec![ScriptedAction::Chunks(vec!["hello ".into(), "world".into()])],
        ));
        let shared = limiter();
        let router = ModelRouter::builder()
            .provider(a)
            .provider(b)
            .role(
                ModelRole::Chat,
                vec![
                    ModelBinding::new("provider_a", "model_x"),
                    ModelBinding::new("provider_b", "model_y"),
                ],
            )
            .build(Arc::clone(&shared));

        let stream = router
            .stream(ModelRole::Chat, PrincipalId::new(), request())
            .unwrap();
        let response = ModelRouter::accumulate(stream).await.unwrap();
        assert_eq!(response.text, "hello world");
        assert_eq!(response.provider, "provider_b");

        // One committed request: A's reservation rolled back.
        assert_eq!(shared.usage(WindowKind::Daily).requests, 1);
    }

    #[tokio::test]
    async fn exhausted_when_every_binding_fails() {
        let a = Arc::new(ScriptedProvider::new(
            "provider_a",
            vec![
                ScriptedAction::Transient("503".into()),
                ScriptedAction::Transient("504".into()),
            ],
        ));
        let router = ModelRouter::builder()
            .provider(a)
            .role(
                ModelRole::Chat,
                vec![
                    ModelBinding::new("provider_a", "model_x"),
                    ModelBinding::new("provider_a", "model_x_backup"),
                ],
            )
            .build(limiter());

        let err = router
            .complete(ModelRole::Chat, PrincipalId::new(), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn embedding_round_trip() {
        let provider = Arc::new(ScriptedProvider::new("embedder", vec![]));
        let router = ModelRouter::builder()
            .provider(provider)
            .role(
                ModelRole::Embedding,
                vec![ModelBinding::new("embedder", "small").free_model()],
            )
            .build(limiter());

        let vectors = router
            .embed(PrincipalId::new(), &["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 32);
    }
}
