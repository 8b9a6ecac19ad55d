//! Channel fabric error types.

use itak_core::{Classify, ErrorKind};
use thiserror::Error;

/// Errors from adapters and the fabric.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No principal is bound to the external identity.
    #[error("no principal bound to {channel}:{external_id}")]
    UnknownIdentity {
        /// Channel name.
        channel: String,
        /// The unresolved external id.
        external_id: String,
    },

    /// Webhook signature verification failed.
    #[error("webhook signature invalid for route '{route}'")]
    BadSignature {
        /// The route.
        route: String,
    },

    /// The runtime rejected the message (queue full).
    #[error(transparent)]
    Runtime(#[from] itak_runtime::RuntimeError),

    /// Attachment download or storage failed.
    #[error("media handling failed: {0}")]
    Media(String),

    /// Adapter transport failure.
    #[error("adapter transport error: {0}")]
    Transport(String),

    /// An outbound target failed the SSRF guard or allowlist.
    #[error(transparent)]
    Tool(#[from] itak_tools::ToolError),

    /// Vault lookup failure for a per-route secret.
    #[error(transparent)]
    Vault(#[from] itak_vault::VaultError),
}

impl Classify for ChannelError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownIdentity { .. } => ErrorKind::PermissionDenied,
            Self::BadSignature { .. } => ErrorKind::PolicyViolation,
            Self::Runtime(e) => e.kind(),
            Self::Media(_) | Self::Transport(_) => ErrorKind::ProviderTransient,
            Self::Tool(e) => e.kind(),
            Self::Vault(e) => e.kind(),
        }
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
