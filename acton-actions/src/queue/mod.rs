//! Queue abstraction over the durable broker.
//!
//! Wraps a [`Broker`] with the per-action-name resource model the runtime
//! relies on: at most one queue handle, one worker, and one event
//! subscription per action name for the lifetime of the `Queue` instance.
//! Get-or-create is single-flight — the creation path holds the map's async
//! lock, so concurrent first access cannot create duplicates.

mod pending;
mod worker;

pub use worker::{Worker, WorkerOptions};

use crate::action::JobProcessor;
use crate::broker::{Broker, BrokerError, Job, JobId, JobOptions, JobPayload};
use crate::error::{ActionError, ActionResult};
use pending::{PendingJob, PendingJobs};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default execution window for request/response correlation.
const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to one named queue on the broker.
///
/// Creation is purely local; broker I/O happens on the operations.
pub struct QueueHandle {
    name: String,
    broker: Arc<dyn Broker>,
}

impl QueueHandle {
    /// The queue's name (the action name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job on this queue.
    ///
    /// # Errors
    ///
    /// Propagates broker failures.
    pub async fn add(&self, payload: JobPayload, opts: JobOptions) -> Result<Job, BrokerError> {
        self.broker.add(&self.name, payload, opts).await
    }

    /// Look up a job by id.
    ///
    /// # Errors
    ///
    /// Propagates broker failures.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, BrokerError> {
        self.broker.get_job(&self.name, id).await
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.name)
            .finish()
    }
}

/// Event-subscription handle: a task forwarding one queue's broker events
/// into the pending-job map.
struct EventRelay {
    handle: JoinHandle<()>,
}

/// Queue abstraction owning the per-action-name resource maps.
pub struct Queue {
    broker: Arc<dyn Broker>,
    queues: Mutex<HashMap<String, Arc<QueueHandle>>>,
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    events: Mutex<HashMap<String, Arc<EventRelay>>>,
    pending: Arc<PendingJobs>,
    execute_timeout: Duration,
}

impl Queue {
    /// Create a queue abstraction over the given broker.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            pending: Arc::new(PendingJobs::new()),
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
        }
    }

    /// Override the request/response correlation timeout.
    #[must_use]
    pub const fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// The underlying broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Number of outstanding pending-job entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Get or lazily create the handle for a named queue. Memoized — the
    /// same `Arc` is returned for the lifetime of this `Queue`.
    pub async fn get_or_create_q(&self, name: &str) -> Arc<QueueHandle> {
        let mut queues = self.queues.lock().await;
        if let Some(existing) = queues.get(name) {
            return Arc::clone(existing);
        }
        let handle = Arc::new(QueueHandle {
            name: name.to_string(),
            broker: Arc::clone(&self.broker),
        });
        queues.insert(name.to_string(), Arc::clone(&handle));
        handle
    }

    /// Get or lazily create the worker for a named queue. Memoized — if a
    /// worker already exists its options are **not** reconfigured; the
    /// `processor` and `opts` of later calls are ignored.
    pub async fn get_or_create_worker(
        &self,
        name: &str,
        processor: JobProcessor,
        opts: WorkerOptions,
    ) -> Arc<Worker> {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(name) {
            return Arc::clone(existing);
        }
        let worker = Worker::spawn(name.to_string(), Arc::clone(&self.broker), processor, opts);
        workers.insert(name.to_string(), Arc::clone(&worker));
        worker
    }

    /// Get or lazily create the event subscription for a named queue.
    /// Memoized; the relay dispatches `completed`/`failed` events to the
    /// pending-job map for as long as this `Queue` lives.
    ///
    /// # Errors
    ///
    /// Returns a queue-connection error when the broker subscription fails.
    pub async fn get_or_create_q_events(&self, name: &str) -> ActionResult<()> {
        let mut events = self.events.lock().await;
        if events.contains_key(name) {
            return Ok(());
        }

        let mut rx =
            self.broker
                .subscribe(name)
                .await
                .map_err(|source| ActionError::QueueConnection {
                    queue: name.to_string(),
                    source,
                })?;

        let pending = Arc::clone(&self.pending);
        let queue_name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => pending.dispatch(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event relay for {} lagged, skipped {}", queue_name, skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        events.insert(name.to_string(), Arc::new(EventRelay { handle }));
        Ok(())
    }

    /// Enqueue a job on the named queue.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::QueueConnection`] when the broker rejects the
    /// enqueue.
    pub async fn schedule_job(
        &self,
        name: &str,
        payload: JobPayload,
        opts: JobOptions,
    ) -> ActionResult<Job> {
        let queue = self.get_or_create_q(name).await;
        queue
            .add(payload, opts)
            .await
            .map_err(|source| ActionError::QueueConnection {
                queue: name.to_string(),
                source,
            })
    }

    /// Enqueue a fire-and-forget job, recording an informational pending
    /// entry.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::QueueConnection`] when the broker rejects the
    /// enqueue.
    pub async fn add_job(&self, name: &str, payload: JobPayload) -> ActionResult<Job> {
        let data = serde_json::to_value(&payload)?;
        let job = self
            .schedule_job(name, payload, JobOptions::default())
            .await?;
        self.pending.insert(
            job.id,
            PendingJob::Background {
                action: name.to_string(),
                data,
            },
        );
        Ok(job)
    }

    /// Enqueue a job and await its result through the queue's event stream.
    ///
    /// The caller is rejected with a timeout error after the configured
    /// execution window (default 30 s). A timed-out job is removed from the
    /// broker best-effort — if a worker already picked it up, it will still
    /// run to completion even though no caller is waiting (at-least-once
    /// hazard; late completions are dropped by the event relay).
    ///
    /// # Errors
    ///
    /// Returns the handler's reconstructed domain error, a timeout error, or
    /// a queue-connection error.
    pub async fn execute_job(
        &self,
        name: &str,
        payload: JobPayload,
        opts: JobOptions,
    ) -> ActionResult<serde_json::Value> {
        self.get_or_create_q_events(name).await?;
        let data = serde_json::to_value(&payload)?;
        let job = self.schedule_job(name, payload, opts).await?;

        let (tx, rx) = oneshot::channel();
        let timeout_task = {
            let pending = Arc::clone(&self.pending);
            let broker = Arc::clone(&self.broker);
            let queue_name = name.to_string();
            let job_id = job.id;
            let window = self.execute_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let Some(entry) = pending.take(job_id) else {
                    return;
                };
                // Best-effort removal; the job may already be active.
                if let Err(e) = broker.remove_job(&queue_name, job_id).await {
                    warn!("failed to remove timed-out job {}: {}", job_id, e);
                }
                if let PendingJob::Action { tx, .. } = entry {
                    let _ = tx.send(Err(ActionError::Timeout {
                        job_id,
                        action: queue_name,
                    }));
                }
            })
        };

        // No await between the enqueue above and this insert, so on the
        // event-loop path the entry is in place before any completion can be
        // dispatched. The residual cross-thread race mirrors the broker's
        // own delivery races and resolves as a dropped event plus timeout.
        self.pending.insert(
            job.id,
            PendingJob::Action {
                tx,
                timeout: timeout_task,
                action: name.to_string(),
                data,
            },
        );

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Domain(crate::error::ErrorEnvelope::new(
                crate::error::ErrorKind::Internal,
                format!("correlation dropped for job on {name}"),
            ))),
        }
    }

    /// Cancel a pending job by id. Best-effort: returns `false` (logged,
    /// no-op) when the job does not exist, is already active, or has
    /// finished. There is an inherent race between checking state and
    /// removal.
    pub async fn cancel_job_by_id(&self, name: &str, id: JobId) -> bool {
        let job = match self.broker.get_job(name, id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("cancel: job {} not found on {}", id, name);
                return false;
            }
            Err(e) => {
                warn!("cancel: failed to look up job {} on {}: {}", id, name, e);
                return false;
            }
        };

        if job.is_active() || job.is_completed() {
            debug!("cancel: job {} on {} already {:?}", id, name, job.state);
            return false;
        }

        match self.broker.remove_job(name, id).await {
            Ok(removed) => {
                if removed {
                    info!("cancelled job {} on {}", id, name);
                }
                removed
            }
            Err(e) => {
                warn!("cancel: failed to remove job {} on {}: {}", id, name, e);
                false
            }
        }
    }

    /// Remove every repeatable-job definition across the whole broker.
    ///
    /// Discovers queues through the broker's registry plus its key-scan
    /// fallback, so leftovers from previous deployments are found even when
    /// this `Queue` instance never touched their queues. Runs once at
    /// process start, before the current cron set is armed — purge must
    /// precede arming or a restart could leave duplicate repeatable jobs.
    ///
    /// # Errors
    ///
    /// Returns a broker error when discovery fails outright; individual
    /// removal failures are logged and skipped.
    pub async fn clean_all_repeatable_jobs_from_all_queues(&self) -> ActionResult<usize> {
        let queues = self.broker.known_queues().await?;
        let mut removed = 0_usize;

        for queue in queues {
            let repeatables = match self.broker.repeatable_jobs(&queue).await {
                Ok(list) => list,
                Err(e) => {
                    warn!("failed to list repeatable jobs on {}: {}", queue, e);
                    continue;
                }
            };
            for repeatable in repeatables {
                match self
                    .broker
                    .remove_repeatable_by_key(&queue, &repeatable.key)
                    .await
                {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            "failed to remove repeatable {} on {}: {}",
                            repeatable.key, queue, e
                        );
                    }
                }
            }
        }

        info!("removed {} repeatable job definitions", removed);
        Ok(removed)
    }

    /// Close every tracked queue, worker, and event subscription.
    ///
    /// Settle-all semantics: each close is attempted regardless of the
    /// others failing; failures are logged, never thrown; the maps are
    /// always cleared afterwards. Outstanding waiters are rejected so no
    /// caller hangs on a dead queue.
    pub async fn clean(&self) {
        let workers: Vec<Arc<Worker>> = self.workers.lock().await.drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.close().await;
        }

        let relays: Vec<Arc<EventRelay>> = self.events.lock().await.drain().map(|(_, r)| r).collect();
        for relay in relays {
            relay.handle.abort();
        }

        self.queues.lock().await.clear();
        self.pending.drain();
        debug!("queue maps cleared");
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("execute_timeout", &self.execute_timeout)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, RepeatOptions};
    use serde_json::json;

    fn memory_queue() -> Queue {
        Queue::new(Arc::new(MemoryBroker::new()))
    }

    fn noop_processor() -> JobProcessor {
        Arc::new(|_payload| Box::pin(async move { Ok(serde_json::Value::Null) }))
    }

    #[tokio::test]
    async fn test_get_or_create_q_is_memoized() {
        let queue = memory_queue();
        let a = queue.get_or_create_q("test.echo").await;
        let b = queue.get_or_create_q("test.echo").await;
        assert!(Arc::ptr_eq(&a, &b));

        let other = queue.get_or_create_q("test.other").await;
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_get_or_create_worker_ignores_later_settings() {
        let queue = memory_queue();
        let first = queue
            .get_or_create_worker("test.echo", noop_processor(), WorkerOptions::default())
            .await;
        let second = queue
            .get_or_create_worker(
                "test.echo",
                noop_processor(),
                WorkerOptions {
                    concurrency: 99,
                    ..WorkerOptions::default()
                },
            )
            .await;

        assert!(Arc::ptr_eq(&first, &second));
        queue.clean().await;
    }

    #[tokio::test]
    async fn test_get_or_create_q_events_subscribes_once() {
        let counting = Arc::new(crate::testing::CountingBroker::new(Arc::new(
            MemoryBroker::new(),
        )));
        let queue = Queue::new(Arc::clone(&counting) as Arc<dyn Broker>);

        queue.get_or_create_q_events("test.echo").await.unwrap();
        queue.get_or_create_q_events("test.echo").await.unwrap();

        assert_eq!(counting.subscribe_count(), 1);
        queue.clean().await;
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let queue = memory_queue();
        let payload = JobPayload::new(json!({}), json!({}));

        // Unknown job.
        assert!(!queue.cancel_job_by_id("q", JobId::new()).await);

        // Pending job cancels and disappears.
        let job = queue
            .schedule_job("q", payload.clone(), JobOptions::default())
            .await
            .unwrap();
        assert!(queue.cancel_job_by_id("q", job.id).await);
        assert!(queue
            .broker()
            .get_job("q", job.id)
            .await
            .unwrap()
            .is_none());

        // Active job refuses cancellation.
        let job = queue
            .schedule_job("q", payload, JobOptions::default())
            .await
            .unwrap();
        queue.broker().reserve_next("q").await.unwrap().unwrap();
        assert!(!queue.cancel_job_by_id("q", job.id).await);
        assert!(queue
            .broker()
            .get_job("q", job.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_clean_all_repeatables_covers_foreign_queues() {
        let broker = Arc::new(MemoryBroker::new());

        // Seed repeatables directly on the broker, simulating a previous
        // process's leftovers on queues this Queue instance never created.
        for queue_name in ["reports.daily", "cleanup.sessions", "mail.digest"] {
            broker
                .add(
                    queue_name,
                    JobPayload::empty(),
                    JobOptions {
                        repeat: Some(RepeatOptions {
                            pattern: "0 0 * * *".to_string(),
                        }),
                        ..JobOptions::default()
                    },
                )
                .await
                .unwrap();
        }

        let queue = Queue::new(Arc::clone(&broker) as Arc<dyn Broker>);
        let removed = queue
            .clean_all_repeatable_jobs_from_all_queues()
            .await
            .unwrap();
        assert_eq!(removed, 3);

        for queue_name in ["reports.daily", "cleanup.sessions", "mail.digest"] {
            assert!(broker.repeatable_jobs(queue_name).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_clean_clears_maps_and_rejects_waiters() {
        let queue = memory_queue();
        queue.get_or_create_q("q").await;
        queue
            .get_or_create_worker("q", noop_processor(), WorkerOptions::default())
            .await;
        queue.get_or_create_q_events("q").await.unwrap();

        queue.clean().await;

        // Maps are rebuilt lazily afterwards; a fresh handle is a new object.
        let before = queue.get_or_create_q("q").await;
        let again = queue.get_or_create_q("q").await;
        assert!(Arc::ptr_eq(&before, &again));
        assert_eq!(queue.pending_count(), 0);
    }
}
