//! Delivery queue: one worker task running jobs strictly in order.
//!
//! Callers hand in a closure producing a future; the queue boxes it with a
//! reply channel and appends it to an unbounded mpsc. A single worker task
//! pulls jobs one at a time, so job N+1 never starts before job N
//! finishes, and waits out the pacing delay between them.
//!
//! ```text
//! enqueue(T1) ─┐
//! enqueue(T2) ─┼─→ mpsc ─→ worker: T1 ··pacing·· T2 ··pacing·· T3
//! enqueue(T3) ─┘              │       │              │
//!                             └─ oneshot replies to each caller
//! ```
//!
//! A failing or panicking job is logged and reported to its own caller
//! only. The worker keeps going.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, warn};

use crate::QueueError;

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Minimum gap between one job finishing and the next starting.
    pub pacing: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
}

/// Counts since the queue was spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    /// Jobs that ran to completion, successful or not.
    pub finished: u64,
    /// Jobs that returned an error or panicked.
    pub failed: u64,
}

impl QueueStats {
    /// Jobs waiting or running.
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.finished)
    }
}

// ---------------------------------------------------------------------------
// DeliveryQueue
// ---------------------------------------------------------------------------

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle to the queue worker. Clones feed the same worker.
///
/// The worker stops once every handle is dropped and the backlog drains.
#[derive(Clone)]
pub struct DeliveryQueue {
    jobs: mpsc::UnboundedSender<Job>,
    counters: Arc<Counters>,
}

impl DeliveryQueue {
    /// Spawns the worker. Must be called inside a Tokio runtime.
    pub fn spawn(config: QueueConfig) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_worker(rx, config, Arc::clone(&counters)));
        Self { jobs, counters }
    }

    /// Appends `task` to the queue.
    ///
    /// The job is queued when this is called, not when the returned future
    /// is first polled, so call order is run order.
    pub fn enqueue<T, E, F, Fut>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, QueueError<E>>> + Send + 'static
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let counters = Arc::clone(&self.counters);

        let job: Job = Box::pin(async move {
            let outcome = AssertUnwindSafe(async move { task().await })
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    warn!(error = %e, "queued task failed");
                    Err(QueueError::Task(e))
                }
                Err(_) => {
                    error!("queued task panicked");
                    Err(QueueError::Panicked)
                }
            };
            if result.is_err() {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            let _ = reply_tx.send(result);
        });

        let queued = self.jobs.send(job).is_ok();
        if queued {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        }

        async move {
            if !queued {
                return Err(QueueError::Closed);
            }
            reply_rx.await.unwrap_or(Err(QueueError::Closed))
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            finished: self.counters.finished.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>, config: QueueConfig, counters: Arc<Counters>) {
    debug!(pacing_ms = config.pacing.as_millis() as u64, "delivery worker started");
    let mut last_finish: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        if let Some(finished_at) = last_finish {
            sleep_until(finished_at + config.pacing).await;
        }
        job.await;
        counters.finished.fetch_add(1, Ordering::Relaxed);
        last_finish = Some(Instant::now());
    }

    debug!("delivery worker stopped");
}
