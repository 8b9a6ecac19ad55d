//! Router and provider error types.

use itak_core::{Classify, ErrorKind};
use thiserror::Error;

/// Errors from model dispatch.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider failed in a way eligible for fallback: timeout, 5xx,
    /// provider-side rate limit.
    #[error("provider transient failure: {0}")]
    Transient(String),

    /// Provider refused in a way fallback cannot fix: bad credentials,
    /// content-policy refusal, request schema mismatch.
    #[error("provider non-transient failure: {0}")]
    NonTransient(String),

    /// The stream exceeded its role deadline.
    #[error("model stream timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The limiter denied the reservation; dispatch stops immediately.
    #[error("dispatch unavailable: {0}")]
    Unavailable(#[from] itak_limits::Denied),

    /// Every binding in the role's fallback list failed transiently.
    #[error("all {attempts} bindings for role exhausted; last: {last}")]
    Exhausted {
        /// Number of bindings tried.
        attempts: usize,
        /// The last transient error message.
        last: String,
    },

    /// No bindings are configured for the requested role.
    #[error("no bindings configured for role {0}")]
    NoBindings(String),
}

impl Classify for LlmError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::Exhausted { .. } => ErrorKind::ProviderTransient,
            Self::NonTransient(_) => ErrorKind::ProviderNonTransient,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unavailable(denied) => denied.kind(),
            Self::NoBindings(_) => ErrorKind::InternalInvariant,
        }
    }
}

impl LlmError {
    /// Whether the router should try the next binding after this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Result type for model dispatch.
pub type LlmResult<T> = Result<T, LlmError>;
