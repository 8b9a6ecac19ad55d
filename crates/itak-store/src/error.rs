//! Store adapter error types.

use itak_core::{Classify, ErrorKind};
use thiserror::Error;

/// Errors from store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the backend failed.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// A query failed.
    #[error("store query failed: {0}")]
    Query(String),

    /// A row could not be decoded into its domain type.
    #[error("store row decode failed: {0}")]
    Decode(String),

    /// The adapter is administratively or health-wise unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            // Backend hiccups are retried like any transient dependency.
            Self::Connection(_) | Self::Query(_) | Self::Unavailable(_) => {
                ErrorKind::ProviderTransient
            },
            Self::Decode(_) => ErrorKind::InternalInvariant,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
