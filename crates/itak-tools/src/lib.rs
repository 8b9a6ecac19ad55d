//! Tool registry and sandboxed executor.
//!
//! Tools are registered once at init; there is no runtime code loading.
//! Every dispatch runs the same pipeline: typed argument validation,
//! role check, just-in-time secret expansion, pre-hook, sandboxed
//! execution, capture through the output guard, post-hook, result
//! assembly. Network-reaching tools pass their targets through the SSRF
//! guard and the host allowlist.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod builtin;
mod context;
mod error;
mod executor;
mod net;
mod registry;
mod sandbox;
mod spawner;

pub use builtin::{
    BrowserTool, CodeExecTool, DelegateTool, KnowledgeGraphTool, MemoryForgetTool,
    MemoryLoadTool, MemorySaveTool, ResponseTool, WebSearchTool,
};
pub use context::ToolContext;
pub use error::{ToolError, ToolResult};
pub use executor::{ToolExecutor, error_output};
pub use net::{NetworkPolicy, SafeDnsResolver, SsrfGuard, is_safe_ip};
pub use registry::{Tool, ToolOutcome, ToolRegistry, ToolSpec};
pub use sandbox::{SandboxOutput, SandboxRequest, run_sandboxed};
pub use spawner::{
    DelegationRequest, MergeStrategy, SpawnStrategy, SubAgentSpawner, WaitMode,
};

/// Name of the terminal tool. The scheduler exits its loop after this
/// tool's content is emitted.
pub const RESPONSE_TOOL: &str = "response";
