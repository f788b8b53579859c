//! Generic completion queue
//!
//! A single background worker drains a FIFO of submitted items, invokes the
//! configured process function for each, and resolves the submitter's future
//! with the result. FIFO arrival order is the only ordering guarantee. The
//! queue is unbounded by design; capacity control is an external concern and
//! `depth()` exists for back-pressure visibility only.

use crossbeam::queue::SegQueue;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

use tokenmux_common::error::{Result, TokenMuxError};
use tokenmux_common::metrics::METRICS;

/// Boxed async handler invoked by the worker for each queued item
pub type ProcessFn<T, R> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = Result<R>> + Send>> + Send + Sync>;

struct QueueItem<T, R> {
    item: T,
    reply: oneshot::Sender<Result<R>>,
}

/// Single-consumer work queue turning async submissions into futures
pub struct CompletionQueue<T, R> {
    queue: Arc<SegQueue<QueueItem<T, R>>>,
    depth: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T, R> CompletionQueue<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Create the queue and spawn its worker task
    pub fn new(process: ProcessFn<T, R>) -> Self {
        let queue: Arc<SegQueue<QueueItem<T, R>>> = Arc::new(SegQueue::new());
        let depth = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let worker = tokio::spawn(worker_loop(
            Arc::clone(&queue),
            Arc::clone(&depth),
            Arc::clone(&closed),
            Arc::clone(&notify),
            process,
        ));

        CompletionQueue {
            queue,
            depth,
            closed,
            notify,
            worker: parking_lot::Mutex::new(Some(worker)),
        }
    }

    /// Submit an item and await its result
    pub async fn submit(&self, item: T) -> Result<R> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TokenMuxError::cancelled("completion queue is closed"));
        }

        let (reply, rx) = oneshot::channel();
        self.queue.push(QueueItem { item, reply });
        self.depth.fetch_add(1, Ordering::Relaxed);
        METRICS
            .inference
            .queue_depth
            .set(self.depth.load(Ordering::Relaxed) as i64);
        self.notify.notify_one();

        rx.await
            .unwrap_or_else(|_| Err(TokenMuxError::cancelled("completion queue worker stopped")))
    }

    /// Current pending count
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Stop accepting new items, drain the backlog, and join the worker
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("Completion queue closed");
    }
}

async fn worker_loop<T, R>(
    queue: Arc<SegQueue<QueueItem<T, R>>>,
    depth: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
    process: ProcessFn<T, R>,
) where
    T: Send + 'static,
    R: Send + 'static,
{
    loop {
        if let Some(entry) = queue.pop() {
            depth.fetch_sub(1, Ordering::Relaxed);
            METRICS
                .inference
                .queue_depth
                .set(depth.load(Ordering::Relaxed) as i64);

            let result = process(entry.item).await;
            // The submitter may have gone away; that is not our problem
            let _ = entry.reply.send(result);
            continue;
        }

        if closed.load(Ordering::Acquire) {
            trace!("Completion queue worker draining finished");
            break;
        }

        notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn doubler() -> ProcessFn<u32, u32> {
        Arc::new(|n: u32| Box::pin(async move { Ok(n * 2) }))
    }

    #[tokio::test]
    async fn test_submit_resolves_result() {
        let queue = CompletionQueue::new(doubler());
        assert_eq!(queue.submit(21).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let log: Arc<parking_lot::Mutex<Vec<u32>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let process: ProcessFn<u32, ()> = Arc::new(move |n| {
            let log = Arc::clone(&log2);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                log.lock().push(n);
                Ok(())
            })
        });

        let queue = Arc::new(CompletionQueue::new(process));
        let mut handles = Vec::new();
        for n in 0..5u32 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { queue.submit(n).await }));
            // Stagger submissions so arrival order is deterministic
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_drains_then_rejects() {
        let process: ProcessFn<u32, u32> = Arc::new(|n| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(n)
            })
        });
        let queue = Arc::new(CompletionQueue::new(process));

        let queue2 = Arc::clone(&queue);
        let pending = tokio::spawn(async move { queue2.submit(7).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        queue.close().await;

        // The in-flight submission was drained before the worker stopped
        assert_eq!(pending.await.unwrap().unwrap(), 7);

        // New submissions fail immediately
        let err = queue.submit(8).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_depth_reports_pending() {
        let process: ProcessFn<u32, u32> = Arc::new(|n| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(n)
            })
        });
        let queue = Arc::new(CompletionQueue::new(process));

        for n in 0..3 {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.submit(n).await });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        // One item is in flight with the worker, the rest still queued
        assert!(queue.depth() >= 1);
    }
}
