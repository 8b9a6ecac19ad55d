//! Message, binding, and stream types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The four dispatch roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// Main reasoning model driving the monologue.
    Chat,
    /// Small fast model for summaries, extraction, ranking.
    Utility,
    /// Image description.
    Vision,
    /// Text embedding.
    Embedding,
}

impl ModelRole {
    /// The limiter tool-bucket name for this role.
    #[must_use]
    pub fn bucket(self) -> &'static str {
        match self {
            Self::Chat => "model:chat",
            Self::Utility => "model:utility",
            Self::Vision => "model:vision",
            Self::Embedding => "model:embedding",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Utility => write!(f, "utility"),
            Self::Vision => write!(f, "vision"),
            Self::Embedding => write!(f, "embedding"),
        }
    }
}

/// Message author, as seen by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Human input.
    User,
    /// Model output.
    Assistant,
    /// Tool result.
    Tool,
}

/// One prompt message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Author.
    pub role: MessageRole,
    /// Text content.
    pub content: String,
}

impl Message {
    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// A tool-result message.
    #[must_use]
    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
        }
    }
}

/// One provider binding in a role's fallback list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBinding {
    /// Provider name, matched against registered providers.
    pub provider: String,
    /// Model identifier passed to the provider.
    pub model: String,
    /// Context window in tokens.
    pub context_window: usize,
    /// Fraction of the window the scheduler may fill with history.
    pub history_fraction: f32,
    /// Whether the binding accepts image input.
    #[serde(default)]
    pub vision_capable: bool,
    /// Free (local) bindings bypass cost windows but not request buckets.
    #[serde(default)]
    pub free: bool,
    /// USD per 1k prompt tokens.
    #[serde(default)]
    pub input_per_1k: f64,
    /// USD per 1k completion tokens.
    #[serde(default)]
    pub output_per_1k: f64,
    /// Provider-specific extras, passed through opaquely.
    #[serde(default)]
    pub extra_params: Value,
}

impl ModelBinding {
    /// A binding with sensible defaults for tests and local models.
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            context_window: 32_768,
            history_fraction: 0.6,
            vision_capable: false,
            free: false,
            input_per_1k: 0.003,
            output_per_1k: 0.015,
            extra_params: Value::Null,
        }
    }

    /// Mark the binding free.
    #[must_use]
    pub fn free_model(mut self) -> Self {
        self.free = true;
        self.input_per_1k = 0.0;
        self.output_per_1k = 0.0;
        self
    }

    /// Estimated USD for a call of this shape.
    #[must_use]
    pub fn estimate_usd(&self, prompt_tokens: usize, expected_completion: usize) -> f64 {
        if self.free {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            (prompt_tokens as f64 / 1000.0) * self.input_per_1k
                + (expected_completion as f64 / 1000.0) * self.output_per_1k
        }
    }

    /// Actual USD from committed token counts.
    #[must_use]
    pub fn actual_usd(&self, tokens_in: usize, tokens_out: usize) -> f64 {
        self.estimate_usd(tokens_in, tokens_out)
    }
}

/// Token count with an approximation flag.
///
/// When a model's tokenizer is unknown the estimator falls back to
/// characters divided by four and flags the result; provider-reported
/// actuals always override approximations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    /// Token count.
    pub tokens: usize,
    /// Whether the count came from the char/4 fallback.
    pub approximate: bool,
}

impl TokenEstimate {
    /// Exact count from a known tokenizer.
    #[must_use]
    pub fn exact(tokens: usize) -> Self {
        Self {
            tokens,
            approximate: false,
        }
    }

    /// The char/4 fallback for `text`.
    #[must_use]
    pub fn approximate_for(text: &str) -> Self {
        Self {
            tokens: text.len().div_ceil(4),
            approximate: true,
        }
    }
}

/// Token usage for one completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    /// Prompt tokens.
    pub tokens_in: usize,
    /// Completion tokens.
    pub tokens_out: usize,
    /// Whether either count is an estimate rather than provider-reported.
    pub approximate: bool,
}

/// A chat/utility/vision request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// System prompt.
    pub system: String,
    /// Conversation messages, oldest first.
    pub messages: Vec<Message>,
    /// Completion token cap.
    pub max_tokens: usize,
}

impl ChatRequest {
    /// A request with the default completion cap.
    #[must_use]
    pub fn new(system: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
            max_tokens: 1024,
        }
    }

    /// Set the completion cap.
    #[must_use]
    pub fn max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = max;
        self
    }

    /// Total prompt characters, for the fallback token estimator.
    #[must_use]
    pub fn prompt_chars(&self) -> usize {
        self.messages
            .iter()
            .fold(self.system.len(), |acc, m| acc.saturating_add(m.content.len()))
    }
}

/// Events on a routed stream.
///
/// Within one provider attempt chunks arrive in provider-emitted order.
/// A new `Started` event means the previous attempt's deltas must be
/// discarded: the router fell back to the next binding.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A provider attempt began. Resets any accumulated deltas.
    Started {
        /// Provider name.
        provider: String,
        /// Model identifier.
        model: String,
    },
    /// A completion text fragment.
    Delta(String),
    /// The call finished; usage is final.
    Done {
        /// Final usage.
        usage: Usage,
        /// Committed cost in USD.
        cost_usd: f64,
    },
}

/// A fully accumulated response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Completion text.
    pub text: String,
    /// Usage for the call.
    pub usage: Usage,
    /// Cost in USD.
    pub cost_usd: f64,
    /// Provider that served the call.
    pub provider: String,
    /// Model that served the call.
    pub model: String,
}
