//! In-process broker backed by per-queue priority heaps.
//!
//! Used by tests and queue-less development runs. Delivery semantics match
//! the durable broker contract: priority-ordered ready jobs with FIFO
//! tiebreak, delayed jobs promoted once due, repeatable definitions
//! materialized into one-shot jobs on each poll, and completion/failure
//! events fanned out over a broadcast channel per queue.

use super::{
    next_cron_run, Broker, BrokerError, Job, JobId, JobOptions, JobPayload, JobState, QueueEvent,
    RepeatableJob,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Entry in the ready heap. Higher priority first; FIFO within a priority.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    id: JobId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority wins, older seq breaks ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Per-queue broker state.
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BTreeMap<(DateTime<Utc>, u64), JobId>,
    jobs: HashMap<JobId, Job>,
    repeatables: HashMap<String, RepeatableJob>,
    events: broadcast::Sender<QueueEvent>,
    seq: u64,
}

impl QueueState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ready: BinaryHeap::new(),
            delayed: BTreeMap::new(),
            jobs: HashMap::new(),
            repeatables: HashMap::new(),
            events,
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Move delayed jobs whose due time has passed onto the ready heap.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        loop {
            let Some((&(due, seq), &id)) = self.delayed.first_key_value() else {
                break;
            };
            if due > now {
                break;
            }
            self.delayed.remove(&(due, seq));
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                let priority = job.opts.priority;
                self.ready.push(ReadyEntry { priority, seq, id });
            }
        }
    }

    /// Enqueue one-shot jobs for every repeatable definition that is due.
    fn materialize_repeatables(&mut self, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .repeatables
            .values()
            .filter(|r| r.next_run <= now)
            .map(|r| r.key.clone())
            .collect();

        for key in due {
            let Some(repeatable) = self.repeatables.get_mut(&key) else {
                continue;
            };
            let pattern = repeatable.pattern.clone();
            let queue = repeatable.queue.clone();
            if let Ok(next) = next_cron_run(&pattern, now) {
                repeatable.next_run = next;
            } else {
                // Pattern was validated on registration; treat a failure here
                // as a disabled definition rather than poisoning the poll.
                self.repeatables.remove(&key);
                continue;
            }

            let seq = self.next_seq();
            let job = Job {
                id: JobId::new(),
                queue,
                state: JobState::Waiting,
                payload: JobPayload::empty(),
                opts: JobOptions::default(),
                attempts_made: 0,
                enqueued_at: now,
            };
            self.ready.push(ReadyEntry {
                priority: 0,
                seq,
                id: job.id,
            });
            self.jobs.insert(job.id, job);
        }
    }
}

struct State {
    queues: HashMap<String, QueueState>,
    closed: bool,
}

/// In-memory [`Broker`] implementation.
///
/// Cheap to clone conceptually — wrap in an `Arc` and share; all state sits
/// behind a single mutex, which is fine at test scale.
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queues: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut state = self.state.lock();
        let qs = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new);
        f(qs)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.state.lock().closed {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn add(
        &self,
        queue: &str,
        payload: JobPayload,
        opts: JobOptions,
    ) -> Result<Job, BrokerError> {
        self.ensure_open()?;
        let now = Utc::now();

        if let Some(repeat) = &opts.repeat {
            // Validate the pattern up front so a bad cron table entry fails
            // loudly at registration time.
            let next_run = next_cron_run(&repeat.pattern, now)?;
            let key = format!("{queue}:::{}", repeat.pattern);
            let repeatable = RepeatableJob {
                key: key.clone(),
                queue: queue.to_string(),
                pattern: repeat.pattern.clone(),
                next_run,
            };
            self.with_queue(queue, |qs| {
                qs.repeatables.insert(key, repeatable);
            });
            // The returned handle describes the registration; repetitions get
            // fresh ids as they materialize.
            return Ok(Job {
                id: JobId::new(),
                queue: queue.to_string(),
                state: JobState::Delayed,
                payload,
                opts,
                attempts_made: 0,
                enqueued_at: now,
            });
        }

        let job = Job {
            id: JobId::new(),
            queue: queue.to_string(),
            state: if opts.delay.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            payload,
            opts,
            attempts_made: 0,
            enqueued_at: now,
        };

        self.with_queue(queue, |qs| {
            let seq = qs.next_seq();
            match job.opts.delay {
                Some(delay) => {
                    let due = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    qs.delayed.insert((due, seq), job.id);
                }
                None => {
                    qs.ready.push(ReadyEntry {
                        priority: job.opts.priority,
                        seq,
                        id: job.id,
                    });
                }
            }
            qs.jobs.insert(job.id, job.clone());
        });

        Ok(job)
    }

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, BrokerError> {
        Ok(self.with_queue(queue, |qs| qs.jobs.get(&id).cloned()))
    }

    async fn remove_job(&self, queue: &str, id: JobId) -> Result<bool, BrokerError> {
        Ok(self.with_queue(queue, |qs| {
            let removable = qs
                .jobs
                .get(&id)
                .is_some_and(|j| matches!(j.state, JobState::Waiting | JobState::Delayed));
            if removable {
                qs.jobs.remove(&id);
                qs.delayed.retain(|_, job_id| *job_id != id);
                // Ready-heap entries are dropped lazily by reserve_next.
            }
            removable
        }))
    }

    async fn reserve_next(&self, queue: &str) -> Result<Option<Job>, BrokerError> {
        if self.state.lock().closed {
            return Ok(None);
        }
        let now = Utc::now();
        Ok(self.with_queue(queue, |qs| {
            qs.promote_due(now);
            qs.materialize_repeatables(now);

            while let Some(entry) = qs.ready.pop() {
                // Skip entries whose job was removed or already moved on.
                let Some(job) = qs.jobs.get_mut(&entry.id) else {
                    continue;
                };
                if job.state != JobState::Waiting {
                    continue;
                }
                job.state = JobState::Active;
                job.attempts_made += 1;
                return Some(job.clone());
            }
            None
        }))
    }

    async fn complete_job(
        &self,
        queue: &str,
        id: JobId,
        return_value: String,
    ) -> Result<(), BrokerError> {
        self.with_queue(queue, |qs| {
            let remove = qs.jobs.get(&id).is_some_and(|j| j.opts.remove_on_complete);
            if remove {
                qs.jobs.remove(&id);
            } else if let Some(job) = qs.jobs.get_mut(&id) {
                job.state = JobState::Completed;
            }
            let _ = qs.events.send(QueueEvent::Completed {
                job_id: id,
                return_value,
            });
        });
        Ok(())
    }

    async fn retry_job(&self, queue: &str, id: JobId, delay: Duration) -> Result<(), BrokerError> {
        let now = Utc::now();
        self.with_queue(queue, |qs| {
            let seq = qs.next_seq();
            if let Some(job) = qs.jobs.get_mut(&id) {
                if delay.is_zero() {
                    job.state = JobState::Waiting;
                    qs.ready.push(ReadyEntry {
                        priority: job.opts.priority,
                        seq,
                        id,
                    });
                } else {
                    job.state = JobState::Delayed;
                    let due = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    qs.delayed.insert((due, seq), id);
                }
            }
        });
        Ok(())
    }

    async fn fail_job(&self, queue: &str, id: JobId, reason: String) -> Result<(), BrokerError> {
        self.with_queue(queue, |qs| {
            if let Some(job) = qs.jobs.get_mut(&id) {
                job.state = JobState::Failed;
            }
            let _ = qs.events.send(QueueEvent::Failed {
                job_id: id,
                failed_reason: reason,
            });
        });
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<broadcast::Receiver<QueueEvent>, BrokerError> {
        Ok(self.with_queue(queue, |qs| qs.events.subscribe()))
    }

    async fn repeatable_jobs(&self, queue: &str) -> Result<Vec<RepeatableJob>, BrokerError> {
        Ok(self.with_queue(queue, |qs| qs.repeatables.values().cloned().collect()))
    }

    async fn remove_repeatable_by_key(
        &self,
        queue: &str,
        key: &str,
    ) -> Result<bool, BrokerError> {
        Ok(self.with_queue(queue, |qs| qs.repeatables.remove(key).is_some()))
    }

    async fn known_queues(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self.state.lock().queues.keys().cloned().collect())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: i64) -> JobPayload {
        JobPayload::new(json!({}), json!({ "v": v }))
    }

    #[tokio::test]
    async fn test_add_and_reserve_fifo() {
        let broker = MemoryBroker::new();
        let a = broker
            .add("q", payload(1), JobOptions::default())
            .await
            .unwrap();
        let b = broker
            .add("q", payload(2), JobOptions::default())
            .await
            .unwrap();

        let first = broker.reserve_next("q").await.unwrap().unwrap();
        let second = broker.reserve_next("q").await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
        assert!(broker.reserve_next("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_beats_fifo() {
        let broker = MemoryBroker::new();
        broker
            .add("q", payload(1), JobOptions::default())
            .await
            .unwrap();
        let urgent = broker
            .add(
                "q",
                payload(2),
                JobOptions {
                    priority: 5,
                    ..JobOptions::default()
                },
            )
            .await
            .unwrap();

        let first = broker.reserve_next("q").await.unwrap().unwrap();
        assert_eq!(first.id, urgent.id);
    }

    #[tokio::test]
    async fn test_delayed_job_not_due_yet() {
        let broker = MemoryBroker::new();
        broker
            .add(
                "q",
                payload(1),
                JobOptions {
                    delay: Some(Duration::from_secs(3600)),
                    ..JobOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(broker.reserve_next("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_pending_only() {
        let broker = MemoryBroker::new();
        let job = broker
            .add("q", payload(1), JobOptions::default())
            .await
            .unwrap();

        assert!(broker.remove_job("q", job.id).await.unwrap());
        assert!(broker.get_job("q", job.id).await.unwrap().is_none());

        // Unknown id.
        assert!(!broker.remove_job("q", JobId::new()).await.unwrap());

        // Active job refuses removal.
        let job = broker
            .add("q", payload(2), JobOptions::default())
            .await
            .unwrap();
        let reserved = broker.reserve_next("q").await.unwrap().unwrap();
        assert_eq!(reserved.id, job.id);
        assert!(!broker.remove_job("q", job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_emits_event() {
        let broker = MemoryBroker::new();
        let mut events = broker.subscribe("q").await.unwrap();
        let job = broker
            .add("q", payload(1), JobOptions::default())
            .await
            .unwrap();
        broker.reserve_next("q").await.unwrap().unwrap();
        broker
            .complete_job("q", job.id, "\"ok\"".to_string())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            QueueEvent::Completed {
                job_id,
                return_value,
            } => {
                assert_eq!(job_id, job.id);
                assert_eq!(return_value, "\"ok\"");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repeatable_registration_and_removal() {
        let broker = MemoryBroker::new();
        broker
            .add(
                "q",
                JobPayload::empty(),
                JobOptions {
                    repeat: Some(super::super::RepeatOptions {
                        pattern: "* * * * *".to_string(),
                    }),
                    ..JobOptions::default()
                },
            )
            .await
            .unwrap();

        let repeatables = broker.repeatable_jobs("q").await.unwrap();
        assert_eq!(repeatables.len(), 1);
        let key = repeatables[0].key.clone();

        assert!(broker.remove_repeatable_by_key("q", &key).await.unwrap());
        assert!(broker.repeatable_jobs("q").await.unwrap().is_empty());
        assert!(!broker.remove_repeatable_by_key("q", &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_known_queues_includes_foreign_queues() {
        let broker = MemoryBroker::new();
        broker
            .add("alpha", payload(1), JobOptions::default())
            .await
            .unwrap();
        broker.subscribe("beta").await.unwrap();

        let mut queues = broker.known_queues().await.unwrap();
        queues.sort();
        assert_eq!(queues, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_add() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        let err = broker
            .add("q", payload(1), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
    }
}
