//! Configuration for the action runtime.
//!
//! Loaded from multiple sources with clear precedence:
//!
//! 1. Environment variables (highest priority, `ACTON_ACTIONS_` prefix)
//! 2. `./actions.toml` (development)
//! 3. Hardcoded defaults (fallback)
//!
//! # Example Configuration
//!
//! ```toml
//! # actions.toml
//! environment = "production"
//!
//! [queue]
//! redis_url = "redis://localhost:6379"
//! poll_interval_ms = 50
//! execute_timeout_ms = 30000
//! scheduled_concurrency = 10
//! ```

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deployment environment.
///
/// `Testing` disables cron arming on [`crate::runtime::Runtime::start`] so
/// queue-less test runs stay silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Automated test runs.
    Testing,
    /// Deployed.
    Production,
}

/// Queue and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Redis connection URL for the durable broker.
    pub redis_url: String,

    /// Worker poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Request/response correlation timeout in milliseconds.
    pub execute_timeout_ms: u64,

    /// Concurrency for ad-hoc scheduled and cron workers.
    pub scheduled_concurrency: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            poll_interval_ms: 50,
            execute_timeout_ms: 30_000,
            scheduled_concurrency: crate::action::SCHEDULED_WORKER_CONCURRENCY,
        }
    }
}

impl QueueSettings {
    /// Worker poll interval as a `Duration`.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Correlation timeout as a `Duration`.
    #[must_use]
    pub const fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Deployment environment.
    pub environment: Environment,

    /// Queue and worker settings.
    pub queue: QueueSettings,
}

impl ActionsConfig {
    /// Load configuration with the standard precedence.
    ///
    /// # Errors
    ///
    /// Returns a figment error when a source is present but malformed.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Toml::file("actions.toml"))
            .merge(Env::prefixed("ACTON_ACTIONS_").split("__"))
            .extract()
    }
}
