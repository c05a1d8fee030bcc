//! Background task execution
//!
//! Handshake replies run off the request path. Each submission carries a
//! name (for logs and metrics) and a delay applied before the task body
//! starts.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Notify, Semaphore};

use crate::error::AppError;
use crate::metrics::BACKGROUND_TASKS_TOTAL;

/// Boxed background task body
pub type Task = BoxFuture<'static, Result<(), AppError>>;

/// Async task-execution facility
pub trait TaskExecutor: Send + Sync {
    /// Run `task` after `delay`. Failures are logged by the executor.
    fn execute(&self, name: &'static str, delay: Duration, task: Task);
}

/// Tokio-backed [`TaskExecutor`] with a bound on concurrently running tasks
///
/// Delays elapse before a permit is taken, so sleeping tasks do not occupy
/// worker slots.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    permits: Semaphore,
    pending: AtomicUsize,
    idle: Notify,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                permits: Semaphore::new(max_concurrent.max(1)),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Tasks submitted but not yet finished
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until every submitted task has finished.
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

impl TaskExecutor for TaskQueue {
    fn execute(&self, name: &'static str, delay: Duration, task: Task) {
        let inner = self.inner.clone();
        inner.pending.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcome = match inner.permits.acquire().await {
                // A panicking body must still release its pending slot.
                Ok(_permit) => match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(())) => {
                        tracing::debug!(task = name, "Background task finished");
                        "success"
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(task = name, kind = error.kind(), %error, "Background task failed");
                        "failure"
                    }
                    Err(_) => {
                        tracing::error!(task = name, "Background task panicked");
                        "panicked"
                    }
                },
                Err(_) => {
                    tracing::error!(task = name, "Task queue closed; task dropped");
                    "dropped"
                }
            };
            BACKGROUND_TASKS_TOTAL
                .with_label_values(&[name, outcome])
                .inc();

            if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }
}
