//! Monologue scheduler and sub-agent coordination.
//!
//! One scheduler task per session at a time: inbound messages enter a
//! per-session FIFO, sessions run in parallel under a global cap. Each
//! monologue iterates plan/act/observe against the model router and the
//! tool executor, checkpointing every step, with failures routed through
//! the self-healing engine and progress published on a broadcast bus.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod intent;
mod progress;
mod runtime;
mod scheduler;
mod session;
mod subagent;

pub use error::{RuntimeError, RuntimeResult};
pub use intent::{IntentOutcome, parse_intent};
pub use progress::{PresenceState, ProgressEvent};
pub use runtime::{AgentRuntime, InboundMessage, RuntimeConfig, RuntimeServices};
pub use session::{AgentSession, SessionStore, SessionSummary};
pub use subagent::{SubAgentCoordinator, SubAgentProfile};
