//! Deterministic scripted provider for tests and dry runs.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{LlmError, LlmResult};
use crate::provider::{Provider, ProviderEvent, StreamBox};
use crate::types::{ChatRequest, LlmResponse, TokenEstimate, Usage};

/// One scripted provider behavior, consumed in order per call.
#[derive(Debug, Clone)]
pub enum ScriptedAction {
    /// Return this text as a completed response.
    Complete(String),
    /// Stream these chunks, then finish cleanly.
    Chunks(Vec<String>),
    /// Stream these chunks, then fail transiently mid-stream.
    FailMidStream {
        /// Chunks emitted before the failure.
        chunks: Vec<String>,
        /// The transient error message.
        error: String,
    },
    /// Fail transiently before emitting anything.
    Transient(String),
    /// Fail non-transiently (auth, content policy, schema).
    NonTransient(String),
}

/// A provider that replays a script. When the script runs dry it echoes
/// the last user message, which keeps dry-run loops alive.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ScriptedAction>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Create a provider with the given script.
    #[must_use]
    pub fn new(name: impl Into<String>, script: Vec<ScriptedAction>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// How many chat/stream calls this provider served.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    fn next_action(&self, request: &ChatRequest) -> ScriptedAction {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                let echo = request
                    .messages
                    .last()
                    .map_or_else(String::new, |m| m.content.clone());
                ScriptedAction::Complete(format!("echo: {echo}"))
            })
    }

    fn usage_for(request: &ChatRequest, text: &str) -> Usage {
        Usage {
            tokens_in: request.prompt_chars().div_ceil(4),
            tokens_out: TokenEstimate::approximate_for(text).tokens,
            approximate: true,
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, _model: &str, request: &ChatRequest) -> LlmResult<StreamBox> {
        match self.next_action(request) {
            ScriptedAction::Complete(text) => {
                let usage = Self::usage_for(request, &text);
                let events = vec![Ok(ProviderEvent::Delta(text)), Ok(ProviderEvent::Done(usage))];
                Ok(futures::stream::iter(events).boxed())
            },
            ScriptedAction::Chunks(chunks) => {
                let joined = chunks.concat();
                let usage = Self::usage_for(request, &joined);
                let mut events: Vec<LlmResult<ProviderEvent>> =
                    chunks.into_iter().map(|c| Ok(ProviderEvent::Delta(c))).collect();
                events.push(Ok(ProviderEvent::Done(usage)));
                Ok(futures::stream::iter(events).boxed())
            },
            ScriptedAction::FailMidStream { chunks, error } => {
                let mut events: Vec<LlmResult<ProviderEvent>> =
                    chunks.into_iter().map(|c| Ok(ProviderEvent::Delta(c))).collect();
                events.push(Err(LlmError::Transient(error)));
                Ok(futures::stream::iter(events).boxed())
            },
            ScriptedAction::Transient(message) => Err(LlmError::Transient(message)),
            ScriptedAction::NonTransient(message) => Err(LlmError::NonTransient(message)),
        }
    }

    async fn complete(&self, model: &str, request: &ChatRequest) -> LlmResult<LlmResponse> {
        match self.next_action(request) {
            ScriptedAction::Complete(text) => {
                let usage = Self::usage_for(request, &text);
                Ok(LlmResponse {
                    text,
                    usage,
                    cost_usd: 0.0,
                    provider: self.name.clone(),
                    model: model.to_string(),
                })
            },
            ScriptedAction::Chunks(chunks) => {
                let text = chunks.concat();
                let usage = Self::usage_for(request, &text);
                Ok(LlmResponse {
                    text,
                    usage,
                    cost_usd: 0.0,
                    provider: self.name.clone(),
                    model: model.to_string(),
                })
            },
            ScriptedAction::FailMidStream { error, .. } | ScriptedAction::Transient(error) => {
                Err(LlmError::Transient(error))
            },
            ScriptedAction::NonTransient(message) => Err(LlmError::NonTransient(message)),
        }
    }

    async fn embed(&self, _model: &str, texts: &[String]) -> LlmResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| deterministic_embedding(t)).collect())
    }
}

/// A stable 32-dimension pseudo-embedding derived from character trigrams.
///
/// Identical texts map to identical vectors, which is all the scripted
/// provider needs for retrieval tests.
#[must_use]
#[allow(clippy::arithmetic_side_effects)]
pub fn deterministic_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 32];
    let lowered = text.to_lowercase();
    let bytes = lowered.as_bytes();
    for window in bytes.windows(3) {
        let mut h: u32 = 2_166_136_261;
        for &b in window {
            h ^= u32::from(b);
            h = h.wrapping_mul(16_777_619);
        }
        let slot = (h as usize) % v.len();
        v[slot] += 1.0;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_texts_embed_identically() {
        let a = deterministic_embedding("the VPS port is 48920");
        let b = deterministic_embedding("the VPS port is 48920");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn script_is_consumed_in_order() {
        let provider = ScriptedProvider::new(
            "scripted",
            vec![
                ScriptedAction::Transient("503".into()),
                ScriptedAction::Complete("second".into()),
            ],
        );
        let request = ChatRequest::new("sys", vec![crate::Message::user("hi")]);
        assert!(provider.complete("m", &request).await.is_err());
        let response = provider.complete("m", &request).await.unwrap();
        assert_eq!(response.text, "second");
        assert_eq!(provider.calls(), 2);
    }
}
