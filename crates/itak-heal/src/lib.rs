//! Self-healing engine.
//!
//! Failed tool and model calls land here. Errors are classified into
//! categories; repairable ones get a bounded retry with a strategy chosen
//! from (in order) the repair memory, the utility model, and an optional
//! research probe. Successful repairs are persisted as memories so the
//! next occurrence resolves in one lookup. The engine never mutates data
//! stores to "fix" anything; it only retries operations with altered
//! parameters or after prerequisite setup.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod classify;
mod engine;

pub use classify::{ErrorCategory, classify, signature};
pub use engine::{
    Decision, HealConfig, HealContext, HealingEngine, RepairStrategy, StrategyResearcher,
    StrategySource,
};
