//! Runtime: the process-wide orchestrator.
//!
//! Holds the aggregated action registry (the union of every module's
//! registry), owns the optional [`Queue`], arms cron schedules, and routes
//! dispatch. Constructed once at process start and threaded through as an
//! explicit context object — swap in a queue over [`crate::broker::MemoryBroker`]
//! for tests.
//!
//! Lifecycle: `init(modules, queue)` populates state (wholesale — re-init
//! replaces, never merges), `start()` purges stale repeatable jobs then arms
//! the cron set, `shutdown()` closes the queue and clears state; the runtime
//! must be re-initialized before reuse.

use crate::action::{decorate, invoke, ActionDef, ActionReply, SCHEDULED_WORKER_CONCURRENCY};
use crate::broker::{Job, JobId, JobOptions, JobPayload, RepeatOptions};
use crate::config::Environment;
use crate::error::{ActionError, ActionResult};
use crate::module::{Module, ModuleAction};
use crate::queue::{Queue, WorkerOptions};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Input for scheduling a queued action.
#[derive(Debug, Clone)]
pub struct ScheduleInput {
    /// Opaque caller context, forwarded to the handler.
    pub context: Value,
    /// Action input.
    pub input: Value,
    /// Run the job at this instant instead of immediately. Must be strictly
    /// in the future.
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Result of scheduling a queued action.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    /// Broker id of the enqueued job.
    pub job_id: JobId,
    /// The job handle.
    pub job: Job,
}

/// Process-wide action orchestrator.
pub struct Runtime {
    actions: RwLock<HashMap<String, ModuleAction>>,
    crons: RwLock<Vec<String>>,
    queue: RwLock<Option<Arc<Queue>>>,
    environment: Environment,
}

impl Runtime {
    /// Create an uninitialized runtime for the development environment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_environment(Environment::Development)
    }

    /// Create an uninitialized runtime for the given environment.
    #[must_use]
    pub fn with_environment(environment: Environment) -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            crons: RwLock::new(Vec::new()),
            queue: RwLock::new(None),
            environment,
        }
    }

    /// Populate the runtime from the given modules and optional queue.
    ///
    /// State is replaced wholesale: the aggregated registry becomes exactly
    /// the union of these modules' registries. Without a queue, async
    /// dispatch and cron scheduling are disabled and only the in-process
    /// path works (test mode).
    pub fn init(&self, modules: &[Module], queue: Option<Arc<Queue>>) {
        let mut actions = HashMap::new();
        let mut crons = Vec::new();
        for module in modules {
            for (name, entry) in module.actions() {
                actions.insert(name.clone(), entry.clone());
            }
            crons.extend(module.crons().iter().cloned());
        }

        *self.actions.write() = actions;
        *self.crons.write() = crons;
        *self.queue.write() = queue;
    }

    /// Purge stale repeatable jobs across the broker, then arm every
    /// cron-eligible action.
    ///
    /// Safe no-op (with a warning) when no actions are registered, and a
    /// soft skip when there is no queue or the environment is `Testing`.
    ///
    /// # Errors
    ///
    /// Currently infallible; cleanup failures are logged and swallowed so a
    /// broken purge never blocks startup.
    pub async fn start(&self) -> ActionResult<()> {
        if self.actions.read().is_empty() {
            warn!("no app actions or handlers found");
            return Ok(());
        }

        if !self.should_start_queue() {
            warn!("no queue connection or test environment, skipping cron creation");
            return Ok(());
        }

        self.cleanup_repeatable_jobs().await;
        self.start_crons().await;
        Ok(())
    }

    /// Arm every cron-eligible action.
    pub async fn start_crons(&self) {
        info!("starting crons");
        let crons = self.crons.read().clone();
        for name in crons {
            self.start_cron(&name).await;
        }
    }

    /// The registered handler for an action name, if any.
    #[must_use]
    pub fn get_handler(&self, name: &str) -> Option<crate::action::ActionHandler> {
        self.actions
            .read()
            .get(name)
            .and_then(|entry| entry.handler.clone())
    }

    /// The bound queue, if any.
    #[must_use]
    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.queue.read().clone()
    }

    /// Execute an action's handler in-process (the synchronous path).
    ///
    /// The handler runs with freshly injected per-call helpers. Failures are
    /// logged once here, then propagated unchanged to the caller.
    ///
    /// # Errors
    ///
    /// [`ActionError::NoHandler`] when no handler is registered for the
    /// name; otherwise whatever the handler raised.
    pub async fn run_handler(
        &self,
        name: &str,
        context: Value,
        input: Value,
    ) -> ActionResult<ActionReply> {
        let Some(handler) = self.get_handler(name) else {
            return Err(ActionError::NoHandler {
                name: name.to_string(),
                payload: serde_json::json!({ "context": context, "input": input }),
            });
        };

        match invoke(name, &handler, context, input).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                error!("action {} failed: {}", name, err);
                Err(err)
            }
        }
    }

    /// Enqueue an action for queued execution.
    ///
    /// Lazily creates the action's queue and worker (wrapping the registered
    /// handler so each invocation receives fresh per-call helpers), then
    /// enqueues `{context, input}`.
    ///
    /// # Errors
    ///
    /// - [`ActionError::QueueNotBound`] when no queue is bound — scheduling
    ///   without a queue is a programmer error, unlike the cron soft-skip.
    /// - [`ActionError::UnknownAction`] / [`ActionError::NoHandler`] when the
    ///   action was never registered by any loaded module.
    /// - [`ActionError::ScheduleInPast`] when `scheduled_at` is not strictly
    ///   in the future; nothing is enqueued.
    pub async fn schedule_job(
        &self,
        def: &ActionDef,
        input: ScheduleInput,
    ) -> ActionResult<ScheduledJob> {
        let queue = self.require_queue()?;
        let entry = self.resolve_action(def.name())?;
        let processor = self.processor_for(&entry)?;

        queue.get_or_create_q(def.name()).await;
        queue
            .get_or_create_worker(def.name(), processor, worker_options_for(&entry))
            .await;

        let mut opts = JobOptions::default();
        if let Some(scheduled_at) = input.scheduled_at {
            let delay = (scheduled_at - Utc::now())
                .to_std()
                .ok()
                .filter(|d| !d.is_zero())
                .ok_or(ActionError::ScheduleInPast(scheduled_at))?;
            opts.delay = Some(delay);
        }
        if let Some(retry) = entry.def.settings().and_then(|s| s.retry) {
            opts.attempts = retry.attempts;
            opts.backoff = retry.backoff;
        }

        let job = queue
            .schedule_job(
                def.name(),
                JobPayload::new(input.context, input.input),
                opts,
            )
            .await?;

        Ok(ScheduledJob { job_id: job.id, job })
    }

    /// Enqueue a fire-and-forget job for an action.
    ///
    /// Creates the queue and worker like [`Self::schedule_job`], records an
    /// informational pending entry, and returns without waiting.
    ///
    /// # Errors
    ///
    /// Same registration and connection errors as [`Self::schedule_job`].
    pub async fn enqueue_job(
        &self,
        def: &ActionDef,
        context: Value,
        input: Value,
    ) -> ActionResult<Job> {
        let queue = self.require_queue()?;
        let entry = self.resolve_action(def.name())?;
        let processor = self.processor_for(&entry)?;

        queue.get_or_create_q(def.name()).await;
        queue
            .get_or_create_worker(def.name(), processor, worker_options_for(&entry))
            .await;

        queue.add_job(def.name(), JobPayload::new(context, input)).await
    }

    /// Execute an action over the queue and await its result (the
    /// request/response correlation path).
    ///
    /// # Errors
    ///
    /// The handler's reconstructed domain error, a timeout error after the
    /// correlation window, or the registration/connection errors of
    /// [`Self::schedule_job`].
    pub async fn execute_job(
        &self,
        def: &ActionDef,
        context: Value,
        input: Value,
    ) -> ActionResult<ActionReply> {
        let queue = self.require_queue()?;
        let entry = self.resolve_action(def.name())?;
        let processor = self.processor_for(&entry)?;

        queue.get_or_create_q(def.name()).await;
        queue
            .get_or_create_worker(def.name(), processor, worker_options_for(&entry))
            .await;

        let opts = JobOptions {
            remove_on_complete: true,
            priority: 0,
            ..JobOptions::default()
        };
        let value = queue
            .execute_job(def.name(), JobPayload::new(context, input), opts)
            .await?;

        // Return values that are not a reply envelope pass through as data.
        Ok(serde_json::from_value(value.clone()).unwrap_or(ActionReply {
            data: value,
            context: Value::Null,
        }))
    }

    /// Cancel a scheduled job. Returns `false` when there is no queue, the
    /// job is unknown, or it is already active or finished.
    pub async fn cancel_scheduled_job(&self, action_name: &str, job_id: JobId) -> bool {
        let Some(queue) = self.queue() else {
            warn!("no queue bound, cannot cancel job {}", job_id);
            return false;
        };
        queue.cancel_job_by_id(action_name, job_id).await
    }

    /// Gracefully shut the runtime down: close the queue's resources and
    /// clear all state. The runtime must be re-initialized before reuse.
    pub async fn shutdown(&self) {
        info!("starting graceful shutdown of action runtime");

        let queue = self.queue.write().take();
        if let Some(queue) = queue {
            queue.clean().await;
            info!("queue connections closed");
        }

        self.actions.write().clear();
        self.crons.write().clear();
        info!("action runtime shutdown complete");
    }

    async fn start_cron(&self, name: &str) {
        info!("starting cron for {}", name);

        let Some(queue) = self.queue() else {
            warn!("no queue, cannot start cron for {}", name);
            return;
        };
        let entry = match self.resolve_action(name) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("cannot start cron for {}: {}", name, e);
                return;
            }
        };
        let Some(interval) = entry.def.cron() else {
            warn!("no cron settings on {}", name);
            return;
        };
        let processor = match self.processor_for(&entry) {
            Ok(p) => p,
            Err(e) => {
                warn!("cannot start cron for {}: {}", name, e);
                return;
            }
        };

        queue.get_or_create_q(name).await;
        queue
            .get_or_create_worker(name, processor, worker_options_for(&entry))
            .await;

        let opts = JobOptions {
            repeat: Some(RepeatOptions {
                pattern: interval.pattern().to_string(),
            }),
            ..JobOptions::default()
        };
        match queue.schedule_job(name, JobPayload::empty(), opts).await {
            Ok(_) => info!("started cron {}: {:?}", name, interval),
            Err(e) => error!("failed to arm cron for {}: {}", name, e),
        }
    }

    /// Purge every repeatable job across the broker before re-arming.
    /// Failures are logged and swallowed — a broken purge must not block
    /// startup.
    async fn cleanup_repeatable_jobs(&self) {
        let Some(queue) = self.queue() else {
            warn!("no queue available for repeatable-job cleanup");
            return;
        };

        info!("cleaning up existing repeatable jobs before startup");
        match queue.clean_all_repeatable_jobs_from_all_queues().await {
            Ok(removed) => info!("cleaned up {} existing repeatable jobs", removed),
            Err(e) => error!("failed to clean up repeatable jobs: {}", e),
        }
    }

    fn should_start_queue(&self) -> bool {
        self.queue.read().is_some() && self.environment != Environment::Testing
    }

    fn require_queue(&self) -> ActionResult<Arc<Queue>> {
        self.queue().ok_or(ActionError::QueueNotBound)
    }

    fn resolve_action(&self, name: &str) -> ActionResult<ModuleAction> {
        self.actions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::UnknownAction(name.to_string()))
    }

    fn processor_for(&self, entry: &ModuleAction) -> ActionResult<crate::action::JobProcessor> {
        let handler = entry
            .handler
            .clone()
            .ok_or_else(|| ActionError::NoHandler {
                name: entry.def.name().to_string(),
                payload: Value::Null,
            })?;
        Ok(decorate(entry.def.name(), handler))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("actions", &self.actions.read().len())
            .field("crons", &self.crons.read().len())
            .field("queue", &self.queue.read().is_some())
            .field("environment", &self.environment)
            .finish()
    }
}

/// Worker options derived from an action's settings: settings concurrency
/// when present, the ad-hoc scheduled-worker default otherwise.
fn worker_options_for(entry: &ModuleAction) -> WorkerOptions {
    let settings = entry.def.settings();
    WorkerOptions {
        concurrency: settings.map_or(SCHEDULED_WORKER_CONCURRENCY, |s| s.concurrency),
        timeout: settings.map_or_else(|| WorkerOptions::default().timeout, |s| s.timeout),
        ..WorkerOptions::default()
    }
}

/// Block until SIGINT or SIGTERM, then gracefully shut the runtime down.
///
/// In-flight jobs mid-handler are not otherwise protected, so processes
/// should exit through this hook rather than aborting.
pub async fn run_until_shutdown(runtime: &Runtime) {
    wait_for_signal().await;
    info!("received shutdown signal, cleaning up");
    runtime.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGINT handler: {}", e);
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
    }
}
