//! Convenience re-exports for downstream crates.

pub use crate::error::{Classify, CorrelationId, ErrorKind, SurfacedError};
pub use crate::lifecycle::LifecyclePoint;
pub use crate::memory::{GraphRelation, MemoryEntry, MemoryId, MemoryTier, Priority};
pub use crate::principal::{Principal, PrincipalId, Role};
pub use crate::session::{RoomType, SessionKey};
pub use crate::task::{Task, TaskId, TaskStatus};
pub use crate::tool::{CostClass, Effect, SideEffectClass, ToolCall, ToolOutput};
pub use crate::turn::{Turn, TurnRole};
pub use crate::working::{Artifact, StepState, StepStatus, WorkingContext};
