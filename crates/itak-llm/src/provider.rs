//! The provider capability contract.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::LlmResult;
use crate::types::{ChatRequest, LlmResponse, TokenEstimate, Usage};

/// Raw event from a single provider attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A completion text fragment.
    Delta(String),
    /// The attempt finished with final usage.
    Done(Usage),
}

/// Type alias for boxed provider streams.
pub type StreamBox = Pin<Box<dyn Stream<Item = LlmResult<ProviderEvent>> + Send>>;

/// A model provider binding's runtime half.
///
/// Implementors speak one concrete wire format; this crate only consumes
/// the capability surface. An implementation must emit stream chunks in
/// the order the provider produced them.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, matched against [`ModelBinding::provider`](crate::ModelBinding).
    fn name(&self) -> &str;

    /// Stream a completion for `model`.
    async fn stream(&self, model: &str, request: &ChatRequest) -> LlmResult<StreamBox>;

    /// Complete without streaming.
    async fn complete(&self, model: &str, request: &ChatRequest) -> LlmResult<LlmResponse>;

    /// Embed a batch of texts.
    async fn embed(&self, model: &str, texts: &[String]) -> LlmResult<Vec<Vec<f32>>>;

    /// Count tokens for `text` under `model`'s tokenizer.
    ///
    /// The default is the char/4 estimator, flagged approximate.
    fn count_tokens(&self, _model: &str, text: &str) -> TokenEstimate {
        TokenEstimate::approximate_for(text)
    }
}
