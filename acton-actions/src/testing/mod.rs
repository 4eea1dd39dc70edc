//! Testing utilities for the action runtime.
//!
//! Provides:
//! - [`CountingBroker`] — a delegating broker wrapper that counts calls, for
//!   asserting memoization and no-enqueue invariants
//! - Prebuilt echo/failing/hanging modules for end-to-end tests

use crate::action::{
    action, group, handler, handler_group, ActionArgs, ActionDef, ActionNode, ActionReply,
};
use crate::broker::{
    Broker, BrokerError, Job, JobId, JobOptions, JobPayload, QueueEvent, RepeatableJob,
};
use crate::error::{ActionResult, ErrorEnvelope, ErrorKind};
use crate::module::Module;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Broker wrapper counting `add` and `subscribe` calls.
///
/// Wrap a [`crate::broker::MemoryBroker`] to assert how often the runtime
/// actually touched the broker, e.g. that a rejected schedule never enqueued
/// anything.
pub struct CountingBroker {
    inner: Arc<dyn Broker>,
    adds: AtomicUsize,
    subscribes: AtomicUsize,
}

impl CountingBroker {
    /// Wrap the given broker.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>) -> Self {
        Self {
            inner,
            adds: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
        }
    }

    /// Number of `add` calls seen so far.
    #[must_use]
    pub fn add_count(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    /// Number of `subscribe` calls seen so far.
    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CountingBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingBroker")
            .field("adds", &self.add_count())
            .field("subscribes", &self.subscribe_count())
            .finish()
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn add(
        &self,
        queue: &str,
        payload: JobPayload,
        opts: JobOptions,
    ) -> Result<Job, BrokerError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.inner.add(queue, payload, opts).await
    }

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, BrokerError> {
        self.inner.get_job(queue, id).await
    }

    async fn remove_job(&self, queue: &str, id: JobId) -> Result<bool, BrokerError> {
        self.inner.remove_job(queue, id).await
    }

    async fn reserve_next(&self, queue: &str) -> Result<Option<Job>, BrokerError> {
        self.inner.reserve_next(queue).await
    }

    async fn complete_job(
        &self,
        queue: &str,
        id: JobId,
        return_value: String,
    ) -> Result<(), BrokerError> {
        self.inner.complete_job(queue, id, return_value).await
    }

    async fn retry_job(&self, queue: &str, id: JobId, delay: Duration) -> Result<(), BrokerError> {
        self.inner.retry_job(queue, id, delay).await
    }

    async fn fail_job(&self, queue: &str, id: JobId, reason: String) -> Result<(), BrokerError> {
        self.inner.fail_job(queue, id, reason).await
    }

    async fn subscribe(&self, queue: &str) -> Result<broadcast::Receiver<QueueEvent>, BrokerError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe(queue).await
    }

    async fn repeatable_jobs(&self, queue: &str) -> Result<Vec<RepeatableJob>, BrokerError> {
        self.inner.repeatable_jobs(queue).await
    }

    async fn remove_repeatable_by_key(
        &self,
        queue: &str,
        key: &str,
    ) -> Result<bool, BrokerError> {
        self.inner.remove_repeatable_by_key(queue, key).await
    }

    async fn known_queues(&self) -> Result<Vec<String>, BrokerError> {
        self.inner.known_queues().await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

/// The echo action definition used by the test modules.
#[must_use]
pub fn echo_def() -> ActionDef {
    action("test.echo")
}

/// The always-failing action definition used by the test modules.
#[must_use]
pub fn failing_def() -> ActionDef {
    action("test.failing")
}

/// The never-completing action definition used by the test modules.
#[must_use]
pub fn hanging_def() -> ActionDef {
    action("test.hanging")
}

/// A module with three handlers:
///
/// - `test.echo` echoes its input back as data
/// - `test.failing` raises `{CONFLICT, "dup", {id: "x"}}`
/// - `test.hanging` never completes
#[must_use]
pub fn test_module() -> Module {
    let tree: ActionNode = group([
        ("echo", echo_def().into()),
        ("failing", failing_def().into()),
        ("hanging", hanging_def().into()),
    ]);

    let mut module = Module::new("Test", &tree);
    module
        .register_handlers(handler_group([
            (
                "echo",
                handler(|args: ActionArgs| async move {
                    Ok(ActionReply {
                        data: args.input,
                        context: args.context,
                    })
                }),
            ),
            (
                "failing",
                handler(|_args: ActionArgs| async move {
                    let result: ActionResult<ActionReply> = Err(crate::error::ActionError::Domain(
                        ErrorEnvelope::new(ErrorKind::Conflict, "dup")
                            .with_data(json!({"id": "x"})),
                    ));
                    result
                }),
            ),
            (
                "hanging",
                handler(|_args: ActionArgs| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ActionReply {
                        data: serde_json::Value::Null,
                        context: serde_json::Value::Null,
                    })
                }),
            ),
        ]))
        .expect("test module handler tree matches its group");
    module
}
