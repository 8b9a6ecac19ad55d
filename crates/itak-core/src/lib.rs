//! iTaK Core - Foundation types for the iTaK agent runtime.
//!
//! This crate provides:
//! - Session keys, principals, and role-based access levels
//! - Transcript turns and working-context state
//! - Memory entries, tiers, and graph relations
//! - Tool call/result shapes shared by the registry and the scheduler
//! - The error taxonomy every subsystem classifies into
//! - Lifecycle points for the extension hook runner

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod prelude;
pub mod principal;
pub mod session;
pub mod task;
pub mod tool;
pub mod turn;
pub mod working;

pub use error::{CorrelationId, ErrorKind, Classify, SurfacedError};
pub use lifecycle::LifecyclePoint;
pub use memory::{GraphRelation, MemoryEntry, MemoryId, MemoryTier, Priority};
pub use principal::{ChannelBinding, Principal, PrincipalId, RatePolicy, Role};
pub use session::{RoomType, SessionKey, SessionKeyParseError};
pub use task::{Task, TaskId, TaskStatus};
pub use tool::{CostClass, Effect, SideEffectClass, ToolCall, ToolOutput};
pub use turn::{Turn, TurnRole};
pub use working::{Artifact, StepState, StepStatus, WorkingContext};
