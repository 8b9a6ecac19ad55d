//! Provider-agnostic model routing.
//!
//! Four roles (`chat`, `utility`, `vision`, `embedding`) each carry an
//! ordered fallback list of provider bindings. Dispatch reserves against
//! the limiter per attempt, falls through transient failures, and commits
//! actuals on success. Concrete provider wire formats live outside this
//! crate; implement [`Provider`] to plug one in.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod provider;
mod router;
mod scripted;
mod types;

pub use error::{LlmError, LlmResult};
pub use provider::{Provider, ProviderEvent, StreamBox};
pub use router::{ModelRouter, RoutedStream, RouterBuilder};
pub use scripted::{ScriptedAction, ScriptedProvider, deterministic_embedding};
pub use types::{
    ChatRequest, LlmResponse, Message, MessageRole, ModelBinding, ModelRole, StreamEvent,
    TokenEstimate, Usage,
};
