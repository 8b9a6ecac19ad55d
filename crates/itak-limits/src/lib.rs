//! Rate and cost budget enforcement.
//!
//! Every model-incurring or rate-limited operation goes through
//! `reserve → commit | rollback`. A reservation must succeed in all
//! applicable buckets (global, per-tool, per-principal) atomically; cost
//! windows (daily/weekly/monthly) apply soft and hard thresholds on top.
//! Repeated authentication failures flip a principal into a timed lockout.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod config;
mod counters;
mod limiter;

pub use config::{CostBudgetConfig, LimiterConfig, LockoutConfig};
pub use counters::{UsageSnapshot, WindowKind, WindowUsage};
pub use limiter::{BudgetWarning, Denied, RateLimiter, Reservation, ReserveRequest};
