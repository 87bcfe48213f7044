//! In-process task substrate: an unbounded channel drained by a bounded
//! worker pool.
//!
//! Delayed tasks are parked on a timer task and re-enter the channel when
//! it fires, so a worker never sleeps through a backoff. Every task is
//! counted from enqueue until its handler returns, which is what
//! [`LocalQueue::wait_idle`] waits on.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::task::VerificationTask;
use crate::observability::Metrics;

/// Destination for follow-up work. Implementations must not block.
pub trait TaskSink: Send + Sync {
    fn enqueue(&self, task: VerificationTask);

    /// Makes `task` runnable once `delay` has elapsed.
    fn enqueue_after(&self, task: VerificationTask, delay: Duration);
}

/// Executes one task to completion.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: VerificationTask);
}

#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sender: mpsc::UnboundedSender<VerificationTask>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<VerificationTask>>>,
    pending: AtomicUsize,
    idle: Notify,
    metrics: Arc<Metrics>,
}

impl QueueInner {
    fn track(&self) {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics
            .pending_tasks
            .set(i64::try_from(pending).unwrap_or(i64::MAX));
    }

    fn settle(&self) {
        let pending = self.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics
            .pending_tasks
            .set(i64::try_from(pending).unwrap_or(i64::MAX));
        if pending == 0 {
            self.idle.notify_waiters();
        }
    }

    fn send(&self, task: VerificationTask) {
        if let Err(mpsc::error::SendError(task)) = self.sender.send(task) {
            error!(
                task = task.kind(),
                item_id = %task.item_id(),
                "task queue is closed, dropping task"
            );
            self.settle();
        }
    }
}

/// Decrements the pending count when a handler finishes, even by panicking.
struct PendingGuard(Arc<QueueInner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.settle();
    }
}

impl LocalQueue {
    #[must_use]
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                sender,
                receiver: Mutex::new(Some(receiver)),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                metrics,
            }),
        }
    }

    /// Starts the dispatch loop. Only the first call gets the receiver; later
    /// calls return a handle that finishes immediately.
    pub fn start(&self, handler: Arc<dyn TaskHandler>, concurrency: usize) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        tokio::spawn(async move {
            let Some(mut receiver) = inner.receiver.lock().await.take() else {
                error!("task queue worker already started");
                return;
            };
            info!(concurrency = semaphore.available_permits(), "starting verification task workers");

            while let Some(task) = receiver.recv().await {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let handler = Arc::clone(&handler);
                let guard = PendingGuard(Arc::clone(&inner));
                tokio::spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    debug!(task = task.kind(), item_id = %task.item_id(), "running task");
                    handler.handle(task).await;
                });
            }
        })
    }

    /// Tasks queued, parked on a timer or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Resolves once no task is queued, delayed or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl TaskSink for LocalQueue {
    fn enqueue(&self, task: VerificationTask) {
        self.inner.track();
        self.inner.send(task);
    }

    fn enqueue_after(&self, task: VerificationTask, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(task);
            return;
        }
        self.inner.track();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.send(task);
        });
    }
}
