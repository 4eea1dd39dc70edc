//! In-memory correlation between enqueued jobs and waiting callers.
//!
//! A `PendingJob` is recorded when a job is enqueued through a path that
//! cares about its outcome, keyed by the broker's job id. The shared event
//! subscription for the queue dispatches `Completed`/`Failed` events here;
//! whichever of completion, failure, or timeout fires first takes the entry
//! out of the map exactly once — no double resolution, no leaked timers.

use crate::broker::{JobId, QueueEvent};
use crate::error::{ActionError, ActionResult, ErrorEnvelope};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bookkeeping entry for one enqueued job.
pub(crate) enum PendingJob {
    /// Request/response: a caller awaits the job's result.
    Action {
        /// Resolves the waiting caller.
        tx: oneshot::Sender<ActionResult<Value>>,
        /// Timeout task racing the completion; aborted on resolution.
        timeout: JoinHandle<()>,
        /// Action name, for diagnostics.
        action: String,
        /// Enqueued payload, attached to failure envelopes.
        data: Value,
    },
    /// Fire-and-forget: informational only.
    Background {
        /// Action name, for diagnostics.
        action: String,
        /// Enqueued payload.
        data: Value,
    },
    /// Reserved for native wait semantics; carries only a reject path.
    #[allow(dead_code)]
    WaitNative {
        /// Rejects the waiter on failure or shutdown.
        reject: oneshot::Sender<ActionError>,
        /// Action name, for diagnostics.
        action: String,
        /// Enqueued payload.
        data: Value,
    },
}

/// Map of outstanding jobs keyed by broker job id.
#[derive(Default)]
pub(crate) struct PendingJobs {
    map: Mutex<HashMap<JobId, PendingJob>>,
}

impl PendingJobs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, id: JobId, job: PendingJob) {
        self.map.lock().insert(id, job);
    }

    /// Take an entry out of the map, if it is still there.
    pub(crate) fn take(&self, id: JobId) -> Option<PendingJob> {
        self.map.lock().remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Route a queue event to its pending entry. Events with no matching
    /// entry (fire-and-forget long gone, or a caller that already timed out)
    /// are dropped.
    pub(crate) fn dispatch(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Completed {
                job_id,
                return_value,
            } => self.resolve_completed(*job_id, return_value),
            QueueEvent::Failed {
                job_id,
                failed_reason,
            } => self.resolve_failed(*job_id, failed_reason),
        }
    }

    fn resolve_completed(&self, id: JobId, return_value: &str) {
        let Some(entry) = self.take(id) else {
            return;
        };
        match entry {
            PendingJob::Action { tx, timeout, .. } => {
                timeout.abort();
                // JSON-serializable return values are stored as JSON strings;
                // anything else passes through as the raw string.
                let value = serde_json::from_str::<Value>(return_value)
                    .unwrap_or_else(|_| Value::String(return_value.to_string()));
                let _ = tx.send(Ok(value));
            }
            PendingJob::Background { action, .. } => {
                debug!("background job {} on {} completed", id, action);
            }
            PendingJob::WaitNative { .. } => {
                // Only a reject path; completion simply clears the entry.
            }
        }
    }

    fn resolve_failed(&self, id: JobId, failed_reason: &str) {
        let Some(entry) = self.take(id) else {
            return;
        };

        let build_error = |action: &str, data: Value| {
            let envelope = ErrorEnvelope::from_fail_reason(failed_reason)
                .with_action(action.to_string())
                .with_data(data);
            warn!("job {} on {} failed: {}", id, action, envelope);
            ActionError::Domain(envelope)
        };

        match entry {
            PendingJob::Action {
                tx,
                timeout,
                action,
                data,
            } => {
                timeout.abort();
                let _ = tx.send(Err(build_error(&action, data)));
            }
            PendingJob::WaitNative {
                reject,
                action,
                data,
            } => {
                let _ = reject.send(build_error(&action, data));
            }
            PendingJob::Background { action, data } => {
                // No waiting caller; the failure is logged and dropped.
                let _ = build_error(&action, data);
            }
        }
    }

    /// Reject every outstanding waiter and clear the map. Used on shutdown
    /// so callers do not hang on a queue that no longer exists.
    pub(crate) fn drain(&self) {
        let entries: Vec<(JobId, PendingJob)> = self.map.lock().drain().collect();
        for (id, entry) in entries {
            let err = || {
                ActionError::Domain(ErrorEnvelope::new(
                    crate::error::ErrorKind::Internal,
                    format!("queue shut down while job {id} was pending"),
                ))
            };
            match entry {
                PendingJob::Action { tx, timeout, .. } => {
                    timeout.abort();
                    let _ = tx.send(Err(err()));
                }
                PendingJob::WaitNative { reject, .. } => {
                    let _ = reject.send(err());
                }
                PendingJob::Background { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn action_entry(
        pending: &PendingJobs,
        id: JobId,
    ) -> oneshot::Receiver<ActionResult<Value>> {
        let (tx, rx) = oneshot::channel();
        let timeout = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        pending.insert(
            id,
            PendingJob::Action {
                tx,
                timeout,
                action: "test.echo".to_string(),
                data: json!({"v": 1}),
            },
        );
        rx
    }

    #[tokio::test]
    async fn test_completed_resolves_with_parsed_json() {
        let pending = PendingJobs::new();
        let id = JobId::new();
        let rx = action_entry(&pending, id);

        pending.dispatch(&QueueEvent::Completed {
            job_id: id,
            return_value: "{\"data\":{\"v\":1},\"context\":{}}".to_string(),
        });

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value, json!({"data": {"v": 1}, "context": {}}));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_completed_falls_back_to_raw_string() {
        let pending = PendingJobs::new();
        let id = JobId::new();
        let rx = action_entry(&pending, id);

        pending.dispatch(&QueueEvent::Completed {
            job_id: id,
            return_value: "not json at all {".to_string(),
        });

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value, json!("not json at all {"));
    }

    #[tokio::test]
    async fn test_failed_reconstructs_envelope_and_attaches_data() {
        let pending = PendingJobs::new();
        let id = JobId::new();
        let rx = action_entry(&pending, id);

        let reason = ErrorEnvelope::new(ErrorKind::Conflict, "dup").to_fail_reason();
        pending.dispatch(&QueueEvent::Failed {
            job_id: id,
            failed_reason: reason,
        });

        match rx.await.unwrap().unwrap_err() {
            ActionError::Domain(env) => {
                assert_eq!(env.kind, ErrorKind::Conflict);
                assert_eq!(env.message, "dup");
                assert_eq!(env.data, Some(json!({"v": 1})));
            }
            other => panic!("expected domain error, got {other:?}"),
        }
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_event_is_dropped() {
        let pending = PendingJobs::new();
        pending.dispatch(&QueueEvent::Completed {
            job_id: JobId::new(),
            return_value: "{}".to_string(),
        });
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_drain_rejects_waiters() {
        let pending = PendingJobs::new();
        let id = JobId::new();
        let rx = action_entry(&pending, id);

        pending.drain();

        assert!(rx.await.unwrap().is_err());
        assert_eq!(pending.len(), 0);
    }
}
