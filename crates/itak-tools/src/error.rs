//! Tool execution error types.

use itak_core::{Classify, ErrorKind, Role};
use thiserror::Error;

/// Errors from the tool pipeline.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Arguments failed the tool's schema.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The caller's role is below the tool's requirement.
    #[error("tool '{tool}' requires {required}, caller is {actual}")]
    PermissionDenied {
        /// Tool name.
        tool: String,
        /// Required role.
        required: Role,
        /// Caller's role.
        actual: Role,
    },

    /// A `{{placeholder}}` had no vault entry.
    #[error(transparent)]
    Vault(#[from] itak_vault::VaultError),

    /// SSRF guard or network allowlist rejection, or a critical pre-hook
    /// block.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// The tool exceeded its wall-clock budget.
    #[error("tool timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The limiter refused the tool bucket.
    #[error(transparent)]
    RateLimited(#[from] itak_limits::Denied),

    /// The monologue was cancelled mid-dispatch.
    #[error("tool cancelled")]
    Cancelled,

    /// Unknown tool name.
    #[error("no tool named '{0}'")]
    UnknownTool(String),

    /// Tool body failure.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Memory fabric failure inside a memory tool.
    #[error(transparent)]
    Memory(#[from] itak_memory::MemoryError),

    /// Store failure inside the knowledge-graph tool.
    #[error(transparent)]
    Store(#[from] itak_store::StoreError),

    /// I/O failure in the sandbox or artifact spill.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ToolError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgs(_) | Self::UnknownTool(_) => ErrorKind::InvalidArgs,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Vault(e) => e.kind(),
            Self::PolicyViolation(_) => ErrorKind::PolicyViolation,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RateLimited(e) => e.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Execution(_) | Self::Io(_) => ErrorKind::ProviderTransient,
            Self::Memory(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Result type for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;
