//! Action definitions, groups, and handler plumbing.
//!
//! An action is a named, typed unit of work. Definitions are pure data built
//! with a fluent constructor — no registration happens at definition time, so
//! the same definition can be referenced by its producing module and any
//! caller without ordering concerns:
//!
//! ```rust
//! use acton_actions::action::{action, group, ActionNode};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SignInRequest {
//!     email: String,
//! }
//!
//! let auth: ActionNode = group([
//!     ("sign_in", action("auth.signIn").input_of::<SignInRequest>().into()),
//!     (
//!         "mail",
//!         group([(
//!             "send_code",
//!             action("auth.mail.sendCode").asynchronous().into(),
//!         )]),
//!     ),
//! ]);
//! ```
//!
//! Registration is deferred to [`crate::module::Module`] construction, which
//! flattens the group tree into a registry keyed by action name.

pub mod cache_key;
mod group;
mod props;
mod settings;

pub use cache_key::CacheKeyBuilder;
pub use group::{group, handler, handler_group, ActionNode, HandlerNode};
pub(crate) use group::{flatten_group, flatten_handlers};
pub use props::{ActionArgs, ActionHandler, ActionReply, JobProcessor};
pub(crate) use props::{decorate, invoke};
pub use settings::{
    ActionSettings, CronInterval, RetryPolicy, DEFAULT_CONCURRENCY, DEFAULT_TIMEOUT,
    GRACEFUL_SHUTDOWN_TIMEOUT, SCHEDULED_WORKER_CONCURRENCY,
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Type-erased boundary contract: checks that a JSON value satisfies the
/// declared shape.
type ContractCheck = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Create an action definition with the given dot-segmented name.
///
/// The name must be globally unique — it doubles as the queue name for
/// queued dispatch.
#[must_use]
pub fn action(name: impl Into<String>) -> ActionDef {
    ActionDef::new(name)
}

/// A named, typed unit of work.
///
/// Immutable after construction except through the fluent builder calls
/// used while defining it.
#[derive(Clone)]
pub struct ActionDef {
    name: String,
    input: Option<ContractCheck>,
    output: Option<ContractCheck>,
    is_async: bool,
    settings: Option<ActionSettings>,
}

impl ActionDef {
    /// Create a definition with the given name. Prefer [`action`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: None,
            output: None,
            is_async: false,
            settings: None,
        }
    }

    /// Declare the input contract: the input must deserialize as `T`.
    #[must_use]
    pub fn input_of<T: DeserializeOwned>(mut self) -> Self {
        self.input = Some(contract_for::<T>());
        self
    }

    /// Declare the output contract: the output must deserialize as `T`.
    #[must_use]
    pub fn output_of<T: DeserializeOwned>(mut self) -> Self {
        self.output = Some(contract_for::<T>());
        self
    }

    /// Hint that this action's default dispatch path is the queue.
    ///
    /// Informational — `call_action` still executes in-process and
    /// `schedule_action` still enqueues, regardless of this flag.
    #[must_use]
    pub const fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Attach execution settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ActionSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// The action's globally unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue is the hinted default dispatch path.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        self.is_async
    }

    /// Execution settings, if any were attached.
    #[must_use]
    pub const fn settings(&self) -> Option<&ActionSettings> {
        self.settings.as_ref()
    }

    /// The cron interval, when this action is cron-eligible.
    #[must_use]
    pub fn cron(&self) -> Option<CronInterval> {
        self.settings.as_ref().and_then(|s| s.cron)
    }

    /// Check a value against the input contract. Passes when no contract
    /// was declared.
    ///
    /// # Errors
    ///
    /// Returns the contract diagnostic when the value does not satisfy the
    /// declared shape.
    pub fn check_input(&self, value: &Value) -> Result<(), String> {
        self.input.as_ref().map_or(Ok(()), |check| check(value))
    }

    /// Check a value against the output contract. Passes when no contract
    /// was declared.
    ///
    /// # Errors
    ///
    /// Returns the contract diagnostic when the value does not satisfy the
    /// declared shape.
    pub fn check_output(&self, value: &Value) -> Result<(), String> {
        self.output.as_ref().map_or(Ok(()), |check| check(value))
    }
}

impl fmt::Debug for ActionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDef")
            .field("name", &self.name)
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("is_async", &self.is_async)
            .field("settings", &self.settings)
            .finish()
    }
}

fn contract_for<T: DeserializeOwned>() -> ContractCheck {
    Arc::new(|value: &Value| {
        serde_json::from_value::<T>(value.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Echo {
        #[allow(dead_code)]
        v: i64,
    }

    #[test]
    fn test_fluent_construction() {
        let def = action("test.echo")
            .input_of::<Echo>()
            .output_of::<Echo>()
            .asynchronous()
            .with_settings(ActionSettings::default().with_concurrency(2));

        assert_eq!(def.name(), "test.echo");
        assert!(def.is_async());
        assert_eq!(def.settings().unwrap().concurrency, 2);
    }

    #[test]
    fn test_input_contract_checks_shape() {
        let def = action("test.echo").input_of::<Echo>();

        assert!(def.check_input(&json!({"v": 1})).is_ok());
        assert!(def.check_input(&json!({"v": "nope"})).is_err());
        assert!(def.check_input(&json!({})).is_err());
    }

    #[test]
    fn test_missing_contract_passes_everything() {
        let def = action("test.raw");
        assert!(def.check_input(&json!("anything")).is_ok());
        assert!(def.check_output(&json!(null)).is_ok());
    }

    #[test]
    fn test_cron_comes_from_settings() {
        let def = action("reports.daily").with_settings(ActionSettings::cron(
            CronInterval::EveryDayAtMidnight,
        ));
        assert_eq!(def.cron(), Some(CronInterval::EveryDayAtMidnight));
        assert!(action("test.echo").cron().is_none());
    }
}
