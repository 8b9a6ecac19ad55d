//! The shared error taxonomy.
//!
//! Crate-local error enums implement [`Classify`] so the self-healer and
//! the user-facing surfaces handle every failure uniformly, regardless of
//! which subsystem produced it.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// User-visible error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller-side schema violation. Never retried.
    InvalidArgs,
    /// Role insufficient. Never retried.
    PermissionDenied,
    /// A `{{placeholder}}` had no vault entry.
    MissingSecret,
    /// Limiter denied the request (rate bucket or lockout).
    RateLimited,
    /// Hard cost budget reached.
    BudgetExceeded,
    /// Provider failure eligible for router-level fallback.
    ProviderTransient,
    /// Auth, content policy, or schema mismatch. No fallback.
    ProviderNonTransient,
    /// External call exceeded its deadline.
    Timeout,
    /// SSRF block, secret leak in strict mode, disallowed network target.
    PolicyViolation,
    /// User cancellation. Terminal, not an error report.
    Cancelled,
    /// Assertion failure inside the runtime.
    InternalInvariant,
}

impl ErrorKind {
    /// Whether the self-healer may attempt a retry for this kind at all.
    #[must_use]
    pub fn is_repairable(self) -> bool {
        matches!(
            self,
            Self::ProviderTransient | Self::Timeout | Self::RateLimited
        )
    }

    /// Whether this kind terminates the monologue without an error report.
    #[must_use]
    pub fn is_silent_terminal(self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgs => write!(f, "invalid_args"),
            Self::PermissionDenied => write!(f, "permission_denied"),
            Self::MissingSecret => write!(f, "missing_secret"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::ProviderTransient => write!(f, "provider_transient"),
            Self::ProviderNonTransient => write!(f, "provider_non_transient"),
            Self::Timeout => write!(f, "timeout"),
            Self::PolicyViolation => write!(f, "policy_violation"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::InternalInvariant => write!(f, "internal_invariant"),
        }
    }
}

/// Implemented by every crate-level error enum so callers can classify
/// without matching concrete types.
pub trait Classify {
    /// The taxonomy category of this error.
    fn kind(&self) -> ErrorKind;
}

/// Correlation id attached to every user-surfaced error for log lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Create a new random correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The structured report shown to the user when an error surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfacedError {
    /// Category.
    pub kind: ErrorKind,
    /// One-line human explanation.
    pub message: String,
    /// Correlation id for log lookup.
    pub correlation_id: CorrelationId,
    /// Step number in the task at which the error occurred, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
}

impl SurfacedError {
    /// Build a report from a classified error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: CorrelationId::new(),
            step: None,
        }
    }

    /// Attach the task step the error occurred at.
    #[must_use]
    pub fn at_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }
}

impl fmt::Display for SurfacedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} (ref {})", self.kind, self.message, self.correlation_id)?;
        if let Some(step) = self.step {
            write!(f, " at step {step}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repairable_kinds() {
        assert!(ErrorKind::ProviderTransient.is_repairable());
        assert!(ErrorKind::Timeout.is_repairable());
        assert!(!ErrorKind::PolicyViolation.is_repairable());
        assert!(!ErrorKind::InvalidArgs.is_repairable());
    }

    #[test]
    fn surfaced_error_formats_with_step() {
        let report = SurfacedError::new(ErrorKind::Timeout, "model stream timed out").at_step(3);
        let text = report.to_string();
        assert!(text.contains("timeout"));
        assert!(text.contains("at step 3"));
    }
}
