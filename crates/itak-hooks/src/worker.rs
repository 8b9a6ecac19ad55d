//! Background worker for hot-path handlers.
//!
//! `llm_stream_chunk` handlers must not await I/O. Any real work gets
//! boxed and pushed here; a single worker task drains the queue in order.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle to the background work queue.
#[derive(Debug, Clone)]
pub struct BackgroundWorker {
    tx: mpsc::Sender<BoxFuture<'static, ()>>,
}

impl BackgroundWorker {
    /// Spawn the worker task and return its handle.
    ///
    /// The worker stops when every handle is dropped.
    #[must_use]
    pub fn spawn(queue_depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<BoxFuture<'static, ()>>(queue_depth.max(1));
        tokio::spawn(async move {
            while let Some(work) = rx.recv().await {
                work.await;
            }
            debug!("Background hook worker drained and stopped");
        });
        Self { tx }
    }

    /// Enqueue work without blocking. Work is dropped (and logged) when
    /// the queue is full; hot-path dispatch never waits.
    pub fn enqueue(&self, work: BoxFuture<'static, ()>) {
        if let Err(e) = self.tx.try_send(work) {
            warn!(error = %e, "Background hook queue full, dropping work");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn enqueued_work_runs() {
        let worker = BackgroundWorker::spawn(8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            worker.enqueue(Box::pin(async move {
                counter.fetch_add(1, Ordering::AcqRel);
            }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::Acquire), 3);
    }
}
