//! Built-in tools.

mod code_exec;
mod delegate;
mod graph;
mod memory;
mod response;
mod web;

pub use code_exec::CodeExecTool;
pub use delegate::DelegateTool;
pub use graph::KnowledgeGraphTool;
pub use memory::{MemoryForgetTool, MemoryLoadTool, MemorySaveTool};
pub use response::ResponseTool;
pub use web::{BrowserTool, WebSearchTool};
