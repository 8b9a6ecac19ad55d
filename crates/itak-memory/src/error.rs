//! Memory fabric error types.

use itak_core::{Classify, ErrorKind};
use thiserror::Error;

/// Errors from fabric operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// A store adapter failed.
    #[error("store error: {0}")]
    Store(#[from] itak_store::StoreError),

    /// The model router failed (extraction, embedding, summarization).
    #[error("model error: {0}")]
    Model(#[from] itak_llm::LlmError),

    /// The requested entry does not exist.
    #[error("no memory entry with id {0}")]
    NotFound(itak_core::MemoryId),

    /// Core-tier file could not be read.
    #[error("core tier read failed: {0}")]
    CoreTier(#[from] std::io::Error),
}

impl Classify for MemoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Model(e) => e.kind(),
            Self::NotFound(_) => ErrorKind::InvalidArgs,
            Self::CoreTier(_) => ErrorKind::InternalInvariant,
        }
    }
}

/// Result type for fabric operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
