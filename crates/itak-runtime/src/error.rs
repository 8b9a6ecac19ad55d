//! Runtime error types.

use itak_core::{Classify, ErrorKind, SessionKey};
use thiserror::Error;

/// Errors from the scheduler and coordinator.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Model dispatch failed beyond recovery.
    #[error(transparent)]
    Llm(#[from] itak_llm::LlmError),

    /// Tool pipeline failure that was not absorbed by the healer.
    #[error(transparent)]
    Tool(#[from] itak_tools::ToolError),

    /// Memory fabric failure.
    #[error(transparent)]
    Memory(#[from] itak_memory::MemoryError),

    /// Checkpoint failure.
    #[error(transparent)]
    Checkpoint(#[from] itak_checkpoint::CheckpointError),

    /// Critical hook aborted the operation.
    #[error(transparent)]
    Hook(#[from] itak_hooks::HookError),

    /// The session's inbound queue is full.
    #[error("session {session} inbound queue is full")]
    QueueFull {
        /// The session.
        session: SessionKey,
    },

    /// The monologue was cancelled.
    #[error("monologue cancelled")]
    Cancelled,

    /// An unknown sub-agent profile or an invalid delegation shape.
    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),

    /// Session persistence failure.
    #[error("session store error: {0}")]
    SessionStore(#[from] std::io::Error),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for RuntimeError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Llm(e) => e.kind(),
            Self::Tool(e) => e.kind(),
            Self::Memory(e) => e.kind(),
            Self::Checkpoint(e) => e.kind(),
            Self::Hook(e) => e.kind(),
            Self::QueueFull { .. } => ErrorKind::RateLimited,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidDelegation(_) => ErrorKind::InvalidArgs,
            Self::SessionStore(_) | Self::Serialization(_) => ErrorKind::InternalInvariant,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
