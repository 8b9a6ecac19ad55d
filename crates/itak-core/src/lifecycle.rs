//! Lifecycle points for the extension hook runner.
//!
//! `LifecyclePoint` lives in `itak-core` so that the hook runner, the
//! scheduler, and the tool executor can all reference it without creating
//! a circular dependency.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Points in the runtime lifecycle at which registered handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePoint {
    /// Agent process initialized.
    AgentInit,
    /// A monologue is starting for a user message.
    MonologueStart,
    /// Top of each scheduler iteration.
    MessageLoopStart,
    /// Before prompt assembly.
    PromptAssembleBefore,
    /// After prompt assembly.
    PromptAssembleAfter,
    /// Before a model call is dispatched.
    LlmCallBefore,
    /// Per streamed chunk. Hot path: handlers must not block.
    LlmStreamChunk,
    /// After a model call completed.
    LlmCallAfter,
    /// Before a tool executes.
    ToolExecuteBefore,
    /// After a tool executed.
    ToolExecuteAfter,
    /// Before a turn is appended to the transcript.
    HistoryAppendBefore,
    /// When an error is being classified.
    ErrorClassify,
    /// The monologue ended.
    MonologueEnd,
    /// Agent process shutting down.
    AgentShutdown,
}

impl LifecyclePoint {
    /// All points, in lifecycle order. Used for registry initialization.
    pub const ALL: [Self; 14] = [
        Self::AgentInit,
        Self::MonologueStart,
        Self::MessageLoopStart,
        Self::PromptAssembleBefore,
        Self::PromptAssembleAfter,
        Self::LlmCallBefore,
        Self::LlmStreamChunk,
        Self::LlmCallAfter,
        Self::ToolExecuteBefore,
        Self::ToolExecuteAfter,
        Self::HistoryAppendBefore,
        Self::ErrorClassify,
        Self::MonologueEnd,
        Self::AgentShutdown,
    ];

    /// Whether handlers at this point run on a hot path and must return
    /// without awaiting I/O.
    #[must_use]
    pub fn is_hot_path(self) -> bool {
        matches!(self, Self::LlmStreamChunk)
    }
}

impl fmt::Display for LifecyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentInit => write!(f, "agent_init"),
            Self::MonologueStart => write!(f, "monologue_start"),
            Self::MessageLoopStart => write!(f, "message_loop_start"),
            Self::PromptAssembleBefore => write!(f, "prompt_assemble_before"),
            Self::PromptAssembleAfter => write!(f, "prompt_assemble_after"),
            Self::LlmCallBefore => write!(f, "llm_call_before"),
            Self::LlmStreamChunk => write!(f, "llm_stream_chunk"),
            Self::LlmCallAfter => write!(f, "llm_call_after"),
            Self::ToolExecuteBefore => write!(f, "tool_execute_before"),
            Self::ToolExecuteAfter => write!(f, "tool_execute_after"),
            Self::HistoryAppendBefore => write!(f, "history_append_before"),
            Self::ErrorClassify => write!(f, "error_classify"),
            Self::MonologueEnd => write!(f, "monologue_end"),
            Self::AgentShutdown => write!(f, "agent_shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_snake_case() {
        assert_eq!(LifecyclePoint::ToolExecuteBefore.to_string(), "tool_execute_before");
        assert_eq!(LifecyclePoint::LlmStreamChunk.to_string(), "llm_stream_chunk");
    }

    #[test]
    fn only_stream_chunk_is_hot() {
        for point in LifecyclePoint::ALL {
            assert_eq!(point.is_hot_path(), point == LifecyclePoint::LlmStreamChunk);
        }
    }
}
