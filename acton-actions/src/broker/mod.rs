//! Durable job-queue broker contract.
//!
//! The runtime builds its execution model on a generic "queue with jobs,
//! workers, and completion events" abstraction. This module defines that
//! contract — named queues, enqueue options (delay, attempts, backoff,
//! repetition), job handles, per-queue event streams, and the discovery
//! primitives the full-sweep repeatable cleanup relies on — plus two
//! implementations:
//!
//! - [`MemoryBroker`] — in-process, used by tests and queue-less dev runs.
//! - [`RedisBroker`] — durable, shared across worker processes
//!   (feature `redis`, enabled by default).

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use redis::RedisBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Wire shape of a job payload: opaque caller context plus action input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Opaque caller context, forwarded to the handler untouched.
    pub context: Value,
    /// Action input.
    pub input: Value,
}

impl JobPayload {
    /// Create a payload from context and input values.
    #[must_use]
    pub const fn new(context: Value, input: Value) -> Self {
        Self { context, input }
    }

    /// The empty payload used for repeatable (cron) jobs.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            context: Value::Object(serde_json::Map::new()),
            input: Value::Null,
        }
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay between attempts.
    Fixed,
    /// Delay doubles with each attempt.
    Exponential,
}

/// Retry backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBackoff {
    /// Strategy used to grow the delay.
    pub kind: BackoffKind,
    /// Base delay before the first retry.
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl JobBackoff {
    /// Delay before the retry following `attempts_made` completed attempts.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let factor = 2_u32.saturating_pow(attempts_made.saturating_sub(1));
                self.delay.saturating_mul(factor)
            }
        }
    }
}

/// Repetition settings for a repeatable (cron) job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron pattern (five-field) driving the repetition.
    pub pattern: String,
}

/// Options applied when enqueueing a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Delay before the job becomes eligible for execution.
    #[serde(default, with = "opt_duration_ms")]
    pub delay: Option<Duration>,
    /// Total attempts allowed (1 = no retries).
    pub attempts: u32,
    /// Backoff between attempts, when `attempts > 1`.
    pub backoff: Option<JobBackoff>,
    /// Repetition settings; a repeatable job is registered instead of a
    /// one-shot job when present.
    pub repeat: Option<RepeatOptions>,
    /// Drop the job record once it completes.
    pub remove_on_complete: bool,
    /// Priority (higher runs first).
    pub priority: i32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: None,
            attempts: 1,
            backoff: None,
            repeat: None,
            remove_on_complete: false,
            priority: 0,
        }
    }
}

/// Lifecycle state of a job inside the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for execution, waiting for a worker.
    Waiting,
    /// Enqueued with a delay that has not elapsed yet.
    Delayed,
    /// Picked up by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed terminally (attempts exhausted).
    Failed,
}

/// A job enqueued against a named queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Queue the job belongs to.
    pub queue: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// The `{context, input}` payload.
    pub payload: JobPayload,
    /// Enqueue options in effect.
    pub opts: JobOptions,
    /// Attempts already made (0 before first execution).
    pub attempts_made: u32,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Whether a worker is currently executing this job.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == JobState::Active
    }

    /// Whether this job finished successfully.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }
}

/// A registered repeatable-job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatableJob {
    /// Stable key identifying the definition (queue + pattern).
    pub key: String,
    /// Queue the repetitions are enqueued on.
    pub queue: String,
    /// Cron pattern driving the repetition.
    pub pattern: String,
    /// Next time a repetition is due.
    pub next_run: DateTime<Utc>,
}

/// Completion/failure notification emitted on a queue's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueEvent {
    /// A job finished successfully.
    Completed {
        /// Id of the finished job.
        job_id: JobId,
        /// Serialized return value (JSON when the handler result was
        /// JSON-serializable, passed through as-is otherwise).
        return_value: String,
    },
    /// A job failed terminally.
    Failed {
        /// Id of the failed job.
        job_id: JobId,
        /// Failure reason string (a serialized [`crate::error::ErrorEnvelope`]
        /// when the worker produced one).
        failed_reason: String,
    },
}

/// Errors surfaced by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker unreachable or connection refused.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The broker was closed and no longer accepts operations.
    #[error("broker is closed")]
    Closed,

    /// A stored record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A cron pattern could not be parsed.
    #[error("invalid cron pattern {pattern}: {detail}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Parser diagnostic.
        detail: String,
    },

    /// Underlying Redis failure.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Contract every durable broker implementation satisfies.
///
/// One logical queue per action name; jobs move `Waiting`/`Delayed` →
/// `Active` → `Completed`/`Failed`; every terminal transition emits a
/// [`QueueEvent`] on the queue's stream.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Enqueue a job (or register a repeatable definition when
    /// `opts.repeat` is set) and return its handle.
    async fn add(
        &self,
        queue: &str,
        payload: JobPayload,
        opts: JobOptions,
    ) -> Result<Job, BrokerError>;

    /// Look up a job snapshot by id. `None` if unknown or already removed.
    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, BrokerError>;

    /// Remove a pending (waiting/delayed) job. Returns `false` if the job is
    /// unknown, active, or already finished — removal is best-effort and
    /// inherently racy against a worker picking the job up.
    async fn remove_job(&self, queue: &str, id: JobId) -> Result<bool, BrokerError>;

    /// Reserve the next due job for execution, marking it active.
    ///
    /// Promotes due delayed jobs and materializes due repeatable definitions
    /// before picking. Returns `None` when nothing is due.
    async fn reserve_next(&self, queue: &str) -> Result<Option<Job>, BrokerError>;

    /// Mark an active job completed and emit `Completed` on the stream.
    async fn complete_job(
        &self,
        queue: &str,
        id: JobId,
        return_value: String,
    ) -> Result<(), BrokerError>;

    /// Re-enqueue an active job for another attempt after `delay`.
    async fn retry_job(&self, queue: &str, id: JobId, delay: Duration) -> Result<(), BrokerError>;

    /// Mark an active job terminally failed and emit `Failed` on the stream.
    async fn fail_job(&self, queue: &str, id: JobId, reason: String) -> Result<(), BrokerError>;

    /// Subscribe to the queue's completion/failure event stream.
    async fn subscribe(&self, queue: &str) -> Result<broadcast::Receiver<QueueEvent>, BrokerError>;

    /// List the repeatable-job definitions registered on a queue.
    async fn repeatable_jobs(&self, queue: &str) -> Result<Vec<RepeatableJob>, BrokerError>;

    /// Remove a repeatable-job definition by key. Returns `false` when the
    /// key is unknown.
    async fn remove_repeatable_by_key(&self, queue: &str, key: &str)
        -> Result<bool, BrokerError>;

    /// Every queue name the broker knows about, including queues created by
    /// other processes. Implementations combine their queue registry with a
    /// key-scan fallback so entries missing from the registry still surface.
    async fn known_queues(&self) -> Result<Vec<String>, BrokerError>;

    /// Release broker resources. Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Compute the next fire time of a five-field cron pattern after `from`.
pub(crate) fn next_cron_run(
    pattern: &str,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>, BrokerError> {
    use std::str::FromStr;

    // The cron crate expects a seconds field; prepend one to the five-field
    // patterns used throughout.
    let with_seconds = format!("0 {pattern}");
    let schedule =
        cron::Schedule::from_str(&with_seconds).map_err(|e| BrokerError::InvalidPattern {
            pattern: pattern.to_string(),
            detail: e.to_string(),
        })?;

    schedule
        .after(&from)
        .next()
        .ok_or_else(|| BrokerError::InvalidPattern {
            pattern: pattern.to_string(),
            detail: "no upcoming fire time".to_string(),
        })
}

/// Serde helper for serializing Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Serde helper for `Option<Duration>` as milliseconds.
mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::duration_ms::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms: Option<u64> = Option::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
