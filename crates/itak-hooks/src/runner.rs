//! Handler registry and dispatch.

use async_trait::async_trait;
use futures::future::BoxFuture;
use itak_core::{Classify, ErrorKind, LifecyclePoint};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use crate::context::HookContext;

/// Hook dispatch errors.
#[derive(Debug, Error)]
pub enum HookError {
    /// A handler failed. Non-critical failures never surface this; it is
    /// produced for the caller only when the handler was critical.
    #[error("critical hook '{name}' at {point} failed: {message}")]
    CriticalFailed {
        /// Handler name.
        name: String,
        /// Lifecycle point.
        point: LifecyclePoint,
        /// Failure message.
        message: String,
    },

    /// A handler reported its own failure.
    #[error("{0}")]
    Handler(String),
}

impl Classify for HookError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InternalInvariant
    }
}

/// Result type for hook handlers.
pub type HookResult<T> = Result<T, HookError>;

/// A registered lifecycle handler.
///
/// Handlers receive the chain's context and return its successor. A
/// handler at a hot-path point must return without awaiting I/O; push
/// real work onto the [`BackgroundWorker`](crate::BackgroundWorker).
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Handler name, for logs.
    fn name(&self) -> &str;

    /// Whether a failure here aborts the chain and the surrounding
    /// operation.
    fn critical(&self) -> bool {
        false
    }

    /// Run the handler.
    async fn run(&self, ctx: HookContext) -> HookResult<HookContext>;
}

type HookFn =
    dyn Fn(HookContext) -> BoxFuture<'static, HookResult<HookContext>> + Send + Sync;

/// A handler built from a closure.
pub struct FnHook {
    name: String,
    critical: bool,
    f: Box<HookFn>,
}

impl FnHook {
    /// Wrap an async closure as a handler.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(HookContext) -> BoxFuture<'static, HookResult<HookContext>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            critical: false,
            f: Box::new(f),
        }
    }

    /// Mark the handler critical.
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

#[async_trait]
impl HookHandler for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical
    }

    async fn run(&self, ctx: HookContext) -> HookResult<HookContext> {
        (self.f)(ctx).await
    }
}

/// Builder for [`HookRunner`]. All registration happens at init; ordering
/// is registration order, never discovery order.
#[derive(Default)]
pub struct HookRunnerBuilder {
    registry: HashMap<LifecyclePoint, Vec<Arc<dyn HookHandler>>>,
}

impl HookRunnerBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at a lifecycle point.
    #[must_use]
    pub fn register(mut self, point: LifecyclePoint, handler: Arc<dyn HookHandler>) -> Self {
        self.registry.entry(point).or_default().push(handler);
        self
    }

    /// Finish the builder.
    #[must_use]
    pub fn build(self) -> HookRunner {
        HookRunner {
            registry: self.registry,
        }
    }
}

/// Dispatches registered handlers for lifecycle points.
pub struct HookRunner {
    registry: HashMap<LifecyclePoint, Vec<Arc<dyn HookHandler>>>,
}

impl std::fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .registry
            .iter()
            .map(|(point, handlers)| (point.to_string(), handlers.len()))
            .collect();
        f.debug_struct("HookRunner").field("handlers", &counts).finish()
    }
}

impl HookRunner {
    /// A runner with no handlers.
    #[must_use]
    pub fn empty() -> Self {
        HookRunnerBuilder::new().build()
    }

    /// Number of handlers at a point.
    #[must_use]
    pub fn handler_count(&self, point: LifecyclePoint) -> usize {
        self.registry.get(&point).map_or(0, Vec::len)
    }

    /// Dispatch `ctx` through every handler registered at its point, in
    /// registration order.
    ///
    /// A failing handler is logged and skipped (the chain continues with
    /// the context as it was before that handler) unless the handler is
    /// critical, in which case the chain aborts.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::CriticalFailed`] when a critical handler fails.
    pub async fn dispatch(&self, ctx: HookContext) -> HookResult<HookContext> {
        let Some(handlers) = self.registry.get(&ctx.point) else {
            return Ok(ctx);
        };
        let point = ctx.point;
        let mut current = ctx;
        for handler in handlers {
            // Keep a copy so an isolated failure cannot eat the chain state.
            let snapshot = current.clone();
            match handler.run(current).await {
                Ok(next) => {
                    debug!(point = %point, handler = handler.name(), "Hook ran");
                    current = next;
                },
                Err(e) if handler.critical() => {
                    error!(point = %point, handler = handler.name(), error = %e, "Critical hook failed");
                    return Err(HookError::CriticalFailed {
                        name: handler.name().to_string(),
                        point,
                        message: e.to_string(),
                    });
                },
                Err(e) => {
                    error!(point = %point, handler = handler.name(), error = %e, "Hook failed, continuing");
                    current = snapshot;
                },
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn appender(name: &str, tag: &'static str) -> Arc<dyn HookHandler> {
        Arc::new(FnHook::new(name, move |mut ctx| {
            Box::pin(async move {
                let mut order = ctx
                    .get_str("order")
                    .map(String::from)
                    .unwrap_or_default();
                order.push_str(tag);
                ctx.set("order", Value::String(order));
                Ok(ctx)
            })
        }))
    }

    fn failer(name: &str) -> Arc<dyn HookHandler> {
        Arc::new(FnHook::new(name, |_ctx| {
            Box::pin(async { Err(HookError::Handler("boom".into())) })
        }))
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let runner = HookRunnerBuilder::new()
            .register(LifecyclePoint::MonologueStart, appender("first", "a"))
            .register(LifecyclePoint::MonologueStart, appender("second", "b"))
            .register(LifecyclePoint::MonologueStart, appender("third", "c"))
            .build();

        let out = runner
            .dispatch(HookContext::new(LifecyclePoint::MonologueStart))
            .await
            .unwrap();
        assert_eq!(out.get_str("order"), Some("abc"));
    }

    #[tokio::test]
    async fn failing_handler_is_isolated() {
        let runner = HookRunnerBuilder::new()
            .register(LifecyclePoint::ToolExecuteAfter, appender("first", "a"))
            .register(LifecyclePoint::ToolExecuteAfter, failer("broken"))
            .register(LifecyclePoint::ToolExecuteAfter, appender("third", "c"))
            .build();

        let out = runner
            .dispatch(HookContext::new(LifecyclePoint::ToolExecuteAfter))
            .await
            .unwrap();
        // "broken" contributed nothing but did not stop "third".
        assert_eq!(out.get_str("order"), Some("ac"));
    }

    #[tokio::test]
    async fn critical_failure_aborts_the_chain() {
        let ran_after = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran_after);
        let tail = Arc::new(FnHook::new("tail", move |ctx| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::AcqRel);
                Ok(ctx)
            })
        }));

        let critical: Arc<dyn HookHandler> = Arc::new(
            FnHook::new("guard", |_ctx| {
                Box::pin(async { Err(HookError::Handler("denied".into())) })
            })
            .critical(),
        );

        let runner = HookRunnerBuilder::new()
            .register(LifecyclePoint::LlmCallBefore, critical)
            .register(LifecyclePoint::LlmCallBefore, tail)
            .build();

        let err = runner
            .dispatch(HookContext::new(LifecyclePoint::LlmCallBefore))
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::CriticalFailed { .. }));
        assert_eq!(ran_after.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn unregistered_point_is_a_no_op() {
        let runner = HookRunner::empty();
        let ctx = HookContext::new(LifecyclePoint::AgentShutdown)
            .with_data("k", Value::String("v".into()));
        let out = runner.dispatch(ctx).await.unwrap();
        assert_eq!(out.get_str("k"), Some("v"));
    }
}
