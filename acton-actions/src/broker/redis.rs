//! Redis-backed broker shared across worker processes.
//!
//! Key layout (all under the `aq:` prefix):
//!
//! - `aq:queues` — set of known queue names (the queue registry)
//! - `aq:{queue}:ready` — ZSET of due job ids, scored by priority then age
//! - `aq:{queue}:delayed` — ZSET of delayed job ids, scored by due time (ms)
//! - `aq:{queue}:job:{id}` — JSON job record
//! - `aq:{queue}:repeat` — hash of repeatable definitions, key → JSON
//! - `aq:{queue}:events` — pub/sub channel carrying [`QueueEvent`] JSON
//!
//! Handoff uses atomic `ZPOPMIN`; delayed promotion and repeatable
//! materialization are idempotent, so concurrent workers across processes
//! stay within the documented at-least-once delivery model.

use super::{
    next_cron_run, Broker, BrokerError, Job, JobId, JobOptions, JobPayload, JobState, QueueEvent,
    RepeatableJob,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const KEY_PREFIX: &str = "aq";
const EVENT_CHANNEL_CAPACITY: usize = 128;
const PROMOTE_BATCH: isize = 16;

fn queues_key() -> String {
    format!("{KEY_PREFIX}:queues")
}

fn ready_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{queue}:ready")
}

fn delayed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{queue}:delayed")
}

fn job_key(queue: &str, id: JobId) -> String {
    format!("{KEY_PREFIX}:{queue}:job:{id}")
}

fn repeat_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{queue}:repeat")
}

fn events_channel(queue: &str) -> String {
    format!("{KEY_PREFIX}:{queue}:events")
}

/// Ready-set score: lower pops first. Priority dominates, enqueue time
/// breaks ties FIFO.
fn ready_score(priority: i32, enqueued_ms: i64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        f64::from(-priority).mul_add(1e13, enqueued_ms as f64)
    }
}

/// Durable [`Broker`] implementation over Redis.
///
/// The command connection is a cloneable [`redis::aio::MultiplexedConnection`];
/// pub/sub listeners run on dedicated connections, one task per subscribed
/// queue, forwarding into a local broadcast channel.
pub struct RedisBroker {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    subscriptions: Mutex<HashMap<String, broadcast::Sender<QueueEvent>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Connect to Redis at the given URL.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the URL is invalid or Redis is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        debug!("connected to redis broker at {}", redis_url);

        Ok(Self {
            client,
            conn,
            subscriptions: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    async fn load_job(
        &self,
        queue: &str,
        id: JobId,
    ) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(job_key(queue, id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_job(&self, job: &Job) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let _: () = conn.set(job_key(&job.queue, job.id), json).await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, event: &QueueEvent) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(event)?;
        let _: () = conn.publish(events_channel(queue), json).await?;
        Ok(())
    }

    /// Move due delayed jobs onto the ready set.
    async fn promote_due(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(delayed_key(queue), 0, now_ms, 0, PROMOTE_BATCH)
            .await?;

        for raw_id in due {
            let Ok(uuid) = raw_id.parse::<uuid::Uuid>() else {
                warn!("dropping malformed delayed entry on {}: {}", queue, raw_id);
                let _: i64 = conn.zrem(delayed_key(queue), &raw_id).await?;
                continue;
            };
            let id = JobId::from(uuid);
            // Only the remover promotes; others lost the race and move on.
            let removed: i64 = conn.zrem(delayed_key(queue), &raw_id).await?;
            if removed == 0 {
                continue;
            }
            if let Some(mut job) = self.load_job(queue, id).await? {
                job.state = JobState::Waiting;
                self.store_job(&job).await?;
                let _: i64 = conn
                    .zadd(
                        ready_key(queue),
                        raw_id,
                        ready_score(job.opts.priority, now_ms),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Enqueue one-shot jobs for repeatable definitions that are due.
    async fn materialize_repeatables(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let entries: HashMap<String, String> = conn.hgetall(repeat_key(queue)).await?;

        for (key, json) in entries {
            let Ok(mut repeatable) = serde_json::from_str::<RepeatableJob>(&json) else {
                warn!("dropping malformed repeatable {} on {}", key, queue);
                let _: i64 = conn.hdel(repeat_key(queue), &key).await?;
                continue;
            };
            if repeatable.next_run > now {
                continue;
            }

            let next = next_cron_run(&repeatable.pattern, now)?;
            repeatable.next_run = next;
            // Advancing next_run first keeps a crashed materialization from
            // double-firing on the next poll.
            let _: () = conn
                .hset(repeat_key(queue), &key, serde_json::to_string(&repeatable)?)
                .await?;

            let job = Job {
                id: JobId::new(),
                queue: queue.to_string(),
                state: JobState::Waiting,
                payload: JobPayload::empty(),
                opts: JobOptions::default(),
                attempts_made: 0,
                enqueued_at: now,
            };
            self.store_job(&job).await?;
            let _: i64 = conn
                .zadd(
                    ready_key(queue),
                    job.id.to_string(),
                    ready_score(0, now.timestamp_millis()),
                )
                .await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("subscriptions", &self.subscriptions.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn add(
        &self,
        queue: &str,
        payload: JobPayload,
        opts: JobOptions,
    ) -> Result<Job, BrokerError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let _: i64 = conn.sadd(queues_key(), queue).await?;

        if let Some(repeat) = &opts.repeat {
            let next_run = next_cron_run(&repeat.pattern, now)?;
            let key = format!("{queue}:::{}", repeat.pattern);
            let repeatable = RepeatableJob {
                key: key.clone(),
                queue: queue.to_string(),
                pattern: repeat.pattern.clone(),
                next_run,
            };
            let _: () = conn
                .hset(repeat_key(queue), &key, serde_json::to_string(&repeatable)?)
                .await?;
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
        self.store_job(&job).await?;

        match job.opts.delay {
            Some(delay) => {
                let due_ms = now.timestamp_millis()
                    + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let _: i64 = conn
                    .zadd(delayed_key(queue), job.id.to_string(), due_ms)
                    .await?;
            }
            None => {
                let _: i64 = conn
                    .zadd(
                        ready_key(queue),
                        job.id.to_string(),
                        ready_score(job.opts.priority, now.timestamp_millis()),
                    )
                    .await?;
            }
        }

        Ok(job)
    }

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, BrokerError> {
        self.load_job(queue, id).await
    }

    async fn remove_job(&self, queue: &str, id: JobId) -> Result<bool, BrokerError> {
        let Some(job) = self.load_job(queue, id).await? else {
            return Ok(false);
        };
        if !matches!(job.state, JobState::Waiting | JobState::Delayed) {
            return Ok(false);
        }

        let mut conn = self.conn.clone();
        let member = id.to_string();
        let from_ready: i64 = conn.zrem(ready_key(queue), &member).await?;
        let from_delayed: i64 = conn.zrem(delayed_key(queue), &member).await?;
        if from_ready + from_delayed == 0 {
            // Lost the race: a worker reserved it between load and removal.
            return Ok(false);
        }
        let _: i64 = conn.del(job_key(queue, id)).await?;
        Ok(true)
    }

    async fn reserve_next(&self, queue: &str) -> Result<Option<Job>, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.promote_due(queue).await?;
        self.materialize_repeatables(queue).await?;

        let mut conn = self.conn.clone();
        loop {
            let popped: Vec<(String, f64)> = conn.zpopmin(ready_key(queue), 1).await?;
            let Some((raw_id, _)) = popped.into_iter().next() else {
                return Ok(None);
            };
            let Ok(uuid) = raw_id.parse::<uuid::Uuid>() else {
                warn!("dropping malformed ready entry on {}: {}", queue, raw_id);
                continue;
            };
            let Some(mut job) = self.load_job(queue, JobId::from(uuid)).await? else {
                // Record vanished (removed between pop and load); keep going.
                continue;
            };
            job.state = JobState::Active;
            job.attempts_made += 1;
            self.store_job(&job).await?;
            return Ok(Some(job));
        }
    }

    async fn complete_job(
        &self,
        queue: &str,
        id: JobId,
        return_value: String,
    ) -> Result<(), BrokerError> {
        if let Some(mut job) = self.load_job(queue, id).await? {
            if job.opts.remove_on_complete {
                let mut conn = self.conn.clone();
                let _: i64 = conn.del(job_key(queue, id)).await?;
            } else {
                job.state = JobState::Completed;
                self.store_job(&job).await?;
            }
        }
        self.publish(
            queue,
            &QueueEvent::Completed {
                job_id: id,
                return_value,
            },
        )
        .await
    }

    async fn retry_job(&self, queue: &str, id: JobId, delay: Duration) -> Result<(), BrokerError> {
        let Some(mut job) = self.load_job(queue, id).await? else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        if delay.is_zero() {
            job.state = JobState::Waiting;
            self.store_job(&job).await?;
            let _: i64 = conn
                .zadd(
                    ready_key(queue),
                    id.to_string(),
                    ready_score(job.opts.priority, now_ms),
                )
                .await?;
        } else {
            job.state = JobState::Delayed;
            self.store_job(&job).await?;
            let due_ms = now_ms + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let _: i64 = conn.zadd(delayed_key(queue), id.to_string(), due_ms).await?;
        }
        Ok(())
    }

    async fn fail_job(&self, queue: &str, id: JobId, reason: String) -> Result<(), BrokerError> {
        if let Some(mut job) = self.load_job(queue, id).await? {
            job.state = JobState::Failed;
            self.store_job(&job).await?;
        }
        self.publish(
            queue,
            &QueueEvent::Failed {
                job_id: id,
                failed_reason: reason,
            },
        )
        .await
    }

    async fn subscribe(&self, queue: &str) -> Result<broadcast::Receiver<QueueEvent>, BrokerError> {
        self.ensure_open()?;
        if let Some(sender) = self.subscriptions.lock().get(queue) {
            return Ok(sender.subscribe());
        }

        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(events_channel(queue)).await?;

        let queue_name = queue.to_string();
        let forward = tx.clone();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let Ok(raw) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<QueueEvent>(&raw) {
                    Ok(event) => {
                        let _ = forward.send(event);
                    }
                    Err(e) => {
                        error!("malformed event on {}: {}", queue_name, e);
                    }
                }
            }
            debug!("event listener for {} stopped", queue_name);
        });

        self.listeners.lock().push(handle);
        self.subscriptions.lock().insert(queue.to_string(), tx);
        Ok(rx)
    }

    async fn repeatable_jobs(&self, queue: &str) -> Result<Vec<RepeatableJob>, BrokerError> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(repeat_key(queue)).await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for (key, json) in entries {
            match serde_json::from_str(&json) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("skipping malformed repeatable {} on {}: {}", key, queue, e),
            }
        }
        Ok(jobs)
    }

    async fn remove_repeatable_by_key(
        &self,
        queue: &str,
        key: &str,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(repeat_key(queue), key).await?;
        Ok(removed > 0)
    }

    async fn known_queues(&self) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn.smembers(queues_key()).await?;

        // Key-scan fallback: surface queues whose registry entry went
        // missing (e.g. a previous deployment's leftovers).
        let pattern = format!("{KEY_PREFIX}:*:repeat");
        let mut iter = conn.scan_match::<_, String>(&pattern).await?;
        let mut scanned = Vec::new();
        while let Some(key) = iter.next_item().await {
            if let Some(queue) = key
                .strip_prefix(&format!("{KEY_PREFIX}:"))
                .and_then(|rest| rest.strip_suffix(":repeat"))
            {
                scanned.push(queue.to_string());
            }
        }
        drop(iter);

        for queue in scanned {
            if !names.contains(&queue) {
                names.push(queue);
            }
        }
        Ok(names)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
        self.subscriptions.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_score_orders_priority_then_age() {
        let older = ready_score(0, 1_000);
        let newer = ready_score(0, 2_000);
        let urgent = ready_score(5, 2_000);

        assert!(older < newer);
        assert!(urgent < older);
    }

    #[test]
    fn test_key_layout() {
        let id = JobId::new();
        assert_eq!(ready_key("auth.signIn"), "aq:auth.signIn:ready");
        assert_eq!(job_key("q", id), format!("aq:q:job:{id}"));
        assert_eq!(events_channel("q"), "aq:q:events");
    }
}
