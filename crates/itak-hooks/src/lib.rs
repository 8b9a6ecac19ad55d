//! Lifecycle hook runner.
//!
//! Handlers are registered once at init, keyed by [`LifecyclePoint`], and
//! run sequentially in registration order. A failing handler is isolated
//! (logged, chain continues) unless it is marked critical. The
//! `llm_stream_chunk` point is a hot path: handlers there must return
//! without awaiting I/O and push any real work onto the background worker.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod context;
mod runner;
mod worker;

pub use context::HookContext;
pub use itak_core::LifecyclePoint;
pub use runner::{FnHook, HookError, HookHandler, HookResult, HookRunner, HookRunnerBuilder};
pub use worker::BackgroundWorker;
