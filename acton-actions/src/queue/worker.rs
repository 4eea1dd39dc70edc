//! Worker: drains a named queue through a job processor.
//!
//! One worker per queue name, created lazily and memoized by the
//! [`crate::queue::Queue`]. The drain loop reserves jobs from the broker and
//! runs each one on its own task, bounded by a concurrency semaphore. A job
//! that fails is retried with its configured backoff until its attempts are
//! exhausted, then failed terminally with a serialized error envelope as the
//! reason.
//!
//! Shutdown is cooperative: closing the worker stops the drain loop but does
//! not interrupt jobs already mid-handler.

use crate::action::JobProcessor;
use crate::broker::{Broker, Job, JobBackoff};
use crate::error::ActionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Options applied when a worker is first created.
///
/// Passing different options to a later `get_or_create_worker` call has no
/// effect — the existing worker is returned unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Maximum jobs processed concurrently.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Per-job execution timeout.
    pub timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: crate::action::SCHEDULED_WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(50),
            timeout: crate::action::DEFAULT_TIMEOUT,
        }
    }
}

/// A running drain loop for one named queue.
pub struct Worker {
    queue: String,
    shutdown: watch::Sender<bool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn a worker draining `queue` with the given processor.
    pub(crate) fn spawn(
        queue: String,
        broker: Arc<dyn Broker>,
        processor: JobProcessor,
        opts: WorkerOptions,
    ) -> Arc<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let loop_queue = queue.clone();
        let handle = tokio::spawn(drain_loop(loop_queue, broker, processor, opts, shutdown_rx));

        Arc::new(Self {
            queue,
            shutdown,
            handle: parking_lot::Mutex::new(Some(handle)),
        })
    }

    /// The queue this worker drains.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop the drain loop and wait for it to exit.
    ///
    /// Jobs already handed to the processor keep running; only the loop
    /// stops picking up new ones.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("worker for {} exited abnormally: {}", self.queue, e);
            }
        }
        debug!("worker for {} closed", self.queue);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue)
            .field("running", &self.handle.lock().is_some())
            .finish()
    }
}

async fn drain_loop(
    queue: String,
    broker: Arc<dyn Broker>,
    processor: JobProcessor,
    opts: WorkerOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(opts.concurrency));
    debug!(
        "worker for {} started (concurrency {})",
        queue, opts.concurrency
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        match broker.reserve_next(&queue).await {
            Ok(Some(job)) => {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let broker = Arc::clone(&broker);
                let processor = Arc::clone(&processor);
                let queue = queue.clone();
                let timeout = opts.timeout;
                tokio::spawn(async move {
                    process_job(&queue, &broker, &processor, job, timeout).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                tokio::select! {
                    () = tokio::time::sleep(opts.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                warn!("worker for {} failed to reserve a job: {}", queue, e);
                tokio::time::sleep(opts.poll_interval).await;
            }
        }
    }

    debug!("worker for {} stopped", queue);
}

async fn process_job(
    queue: &str,
    broker: &Arc<dyn Broker>,
    processor: &JobProcessor,
    job: Job,
    timeout: Duration,
) {
    let outcome = tokio::time::timeout(timeout, processor(job.payload.clone())).await;

    match outcome {
        Ok(Ok(value)) => {
            let return_value =
                serde_json::to_string(&value).unwrap_or_else(|_| value.to_string());
            if let Err(e) = broker.complete_job(queue, job.id, return_value).await {
                error!("failed to mark job {} completed on {}: {}", job.id, queue, e);
            }
        }
        Ok(Err(err)) => {
            settle_failure(queue, broker, &job, &err).await;
        }
        Err(_) => {
            let err = ActionError::Timeout {
                job_id: job.id,
                action: queue.to_string(),
            };
            settle_failure(queue, broker, &job, &err).await;
        }
    }
}

/// Retry with backoff while attempts remain, fail terminally otherwise.
async fn settle_failure(queue: &str, broker: &Arc<dyn Broker>, job: &Job, err: &ActionError) {
    if job.attempts_made < job.opts.attempts {
        let delay = job
            .opts
            .backoff
            .as_ref()
            .map_or(Duration::ZERO, |backoff: &JobBackoff| {
                backoff.delay_for_attempt(job.attempts_made)
            });
        debug!(
            "retrying job {} on {} (attempt {}/{}) after {:?}",
            job.id, queue, job.attempts_made, job.opts.attempts, delay
        );
        if let Err(e) = broker.retry_job(queue, job.id, delay).await {
            error!("failed to re-enqueue job {} on {}: {}", job.id, queue, e);
        }
        return;
    }

    let reason = err.envelope().to_fail_reason();
    if let Err(e) = broker.fail_job(queue, job.id, reason).await {
        error!("failed to mark job {} failed on {}: {}", job.id, queue, e);
    }
}
