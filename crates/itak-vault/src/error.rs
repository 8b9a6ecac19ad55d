//! Vault error types.

use itak_core::{Classify, ErrorKind};
use thiserror::Error;

/// Errors from vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A placeholder named a secret the vault does not hold.
    #[error("no secret named '{name}' is configured")]
    MissingSecret {
        /// The placeholder name. Never the value.
        name: String,
    },

    /// Strict mode: outbound content still contained unexpanded placeholders.
    #[error("unexpanded placeholder '{{{{{name}}}}}' in outbound content")]
    UnexpandedPlaceholder {
        /// The placeholder name.
        name: String,
    },

    /// Secret storage could not be read.
    #[error("vault storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl Classify for VaultError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingSecret { .. } => ErrorKind::MissingSecret,
            Self::UnexpandedPlaceholder { .. } => ErrorKind::PolicyViolation,
            Self::Storage(_) => ErrorKind::InternalInvariant,
        }
    }
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;
