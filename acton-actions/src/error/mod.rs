//! Error types and the wire-level error envelope.
//!
//! Two layers live here:
//!
//! - [`ErrorEnvelope`] — the serialization contract for errors that cross the
//!   broker as a failure-reason string (`{kind, message, data}`). Handlers
//!   raise domain errors in this shape; the completion path reconstructs them
//!   on the other side. A failure reason that does not parse as an envelope
//!   degrades into a generic `INTERNAL` envelope wrapping the raw string.
//! - [`ActionError`] — the crate-wide error enum covering registration
//!   errors, broker connection failures, correlation timeouts, scheduling
//!   mistakes, and domain errors carried as envelopes.
//!
//! Failing to cancel an already-active job is an expected outcome, not an
//! error; cancellation surfaces as a `bool` and never appears here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::broker::{BrokerError, JobId};

/// Result type for action operations.
pub type ActionResult<T> = Result<T, ActionError>;

/// Classification of a domain error, stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Unexpected internal failure.
    Internal,
    /// Input failed boundary validation.
    Validation,
    /// Referenced entity does not exist.
    NotFound,
    /// State conflict (duplicate, version mismatch).
    Conflict,
    /// Caller is not authenticated.
    Unauthorized,
    /// Caller is authenticated but not allowed.
    Forbidden,
    /// Execution exceeded its time window.
    Timeout,
    /// Caller exceeded a rate limit.
    RateLimited,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Internal => "INTERNAL",
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
        };
        f.write_str(s)
    }
}

/// Structured error contract carried across the broker's failure channel.
///
/// Serialized to JSON when a handler fails inside a worker, parsed back by
/// the completion path so a waiting caller receives the same `kind`,
/// `message` and `data` the handler raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ErrorEnvelope {
    /// Error classification.
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload attached by the handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Action name the error originated from, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl ErrorEnvelope {
    /// Create an envelope with the given kind and message.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            action: None,
        }
    }

    /// Attach structured data to the envelope.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the originating action name.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Reconstruct an envelope from a broker failure reason.
    ///
    /// Tries to parse the reason as a serialized envelope; anything that does
    /// not parse becomes a generic `INTERNAL` envelope whose message is the
    /// raw string. This is the documented degradation path, not an error.
    #[must_use]
    pub fn from_fail_reason(reason: &str) -> Self {
        serde_json::from_str(reason)
            .unwrap_or_else(|_| Self::new(ErrorKind::Internal, reason.to_string()))
    }

    /// Serialize the envelope for the broker's failure channel.
    ///
    /// Falls back to a plain `kind: message` rendering if JSON serialization
    /// fails (it cannot for this type, but the channel must never be empty).
    #[must_use]
    pub fn to_fail_reason(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

/// Errors raised by the action runtime.
#[derive(Debug, Error)]
pub enum ActionError {
    /// No definition registered under this action name. Programmer error:
    /// the owning module was never loaded into the runtime.
    #[error("action not registered: {0}")]
    UnknownAction(String),

    /// A definition exists but no handler was attached to it.
    #[error("no handler found for action {name}")]
    NoHandler {
        /// The action name that was looked up.
        name: String,
        /// The payload the caller supplied, kept for diagnostics.
        payload: Value,
    },

    /// A handler was registered for a tree path with no corresponding
    /// action definition. Indicates a mismatched handler tree shape.
    #[error("no action definition found for handler path {0}")]
    UnknownHandlerPath(String),

    /// Async dispatch was requested but the runtime has no bound queue.
    #[error("no queue bound to the runtime")]
    QueueNotBound,

    /// The broker could not be reached while operating on a named queue.
    #[error("queue {queue} connection failed: {source}")]
    QueueConnection {
        /// Name of the queue being created or written to.
        queue: String,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },

    /// Request/response correlation exceeded its execution window.
    #[error("timeout exceeded for job {job_id} on action {action}")]
    Timeout {
        /// Broker id of the timed-out job.
        job_id: JobId,
        /// Action the job was enqueued for.
        action: String,
    },

    /// `scheduled_at` was not strictly in the future.
    #[error("scheduled time must be in the future, got {0}")]
    ScheduleInPast(chrono::DateTime<chrono::Utc>),

    /// Input or output failed its boundary contract.
    #[error("validation failed for action {action}: {detail}")]
    Validation {
        /// Action whose contract was violated.
        action: String,
        /// What the contract check reported.
        detail: String,
    },

    /// Domain error raised by a handler, in the wire envelope shape.
    #[error(transparent)]
    Domain(#[from] ErrorEnvelope),

    /// Payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker failure outside the queue-creation path.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ActionError {
    /// Render this error as a wire envelope.
    ///
    /// Domain errors pass through unchanged; infrastructure errors collapse
    /// into an `INTERNAL` (or `TIMEOUT`) envelope carrying their message.
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        match self {
            Self::Domain(env) => env.clone(),
            Self::Timeout { action, .. } => {
                ErrorEnvelope::new(ErrorKind::Timeout, self.to_string()).with_action(action.clone())
            }
            Self::Validation { action, .. } => {
                ErrorEnvelope::new(ErrorKind::Validation, self.to_string())
                    .with_action(action.clone())
            }
            other => ErrorEnvelope::new(ErrorKind::Internal, other.to_string()),
        }
    }

    /// The domain kind of this error, when it carries one.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Domain(env) => Some(env.kind),
            Self::Timeout { .. } => Some(ErrorKind::Timeout),
            Self::Validation { .. } => Some(ErrorKind::Validation),
            _ => None,
        }
    }
}

/// Error factory pre-scoped to an action name.
///
/// Injected into every handler invocation so domain errors automatically
/// carry the action they originated from.
#[derive(Debug, Clone)]
pub struct ErrorFactory {
    action: String,
}

impl ErrorFactory {
    /// Create a factory scoped to the given action name.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
        }
    }

    /// Build a domain error of the given kind.
    #[must_use]
    pub fn make(&self, kind: ErrorKind, message: impl Into<String>) -> ActionError {
        ActionError::Domain(ErrorEnvelope::new(kind, message).with_action(self.action.clone()))
    }

    /// Build a domain error with attached data.
    #[must_use]
    pub fn make_with_data(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        data: Value,
    ) -> ActionError {
        ActionError::Domain(
            ErrorEnvelope::new(kind, message)
                .with_action(self.action.clone())
                .with_data(data),
        )
    }

    /// Shorthand for an `INTERNAL` domain error.
    #[must_use]
    pub fn internal(&self, message: impl Into<String>) -> ActionError {
        self.make(ErrorKind::Internal, message)
    }

    /// The action name this factory is scoped to.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let env = ErrorEnvelope::new(ErrorKind::Conflict, "dup").with_data(json!({"id": "x"}));
        let reason = env.to_fail_reason();
        let parsed = ErrorEnvelope::from_fail_reason(&reason);

        assert_eq!(parsed.kind, ErrorKind::Conflict);
        assert_eq!(parsed.message, "dup");
        assert_eq!(parsed.data, Some(json!({"id": "x"})));
    }

    #[test]
    fn test_envelope_wire_shape_uses_type_tag() {
        let env = ErrorEnvelope::new(ErrorKind::NotFound, "missing");
        let wire: Value = serde_json::from_str(&env.to_fail_reason()).unwrap();

        assert_eq!(wire["type"], "NOT_FOUND");
        assert_eq!(wire["message"], "missing");
    }

    #[test]
    fn test_unparseable_reason_degrades_to_internal() {
        let env = ErrorEnvelope::from_fail_reason("worker exploded");

        assert_eq!(env.kind, ErrorKind::Internal);
        assert_eq!(env.message, "worker exploded");
        assert!(env.data.is_none());
    }

    #[test]
    fn test_error_factory_scopes_action() {
        let factory = ErrorFactory::new("auth.signIn");
        let err = factory.make(ErrorKind::Unauthorized, "bad code");

        match err {
            ActionError::Domain(env) => {
                assert_eq!(env.action.as_deref(), Some("auth.signIn"));
                assert_eq!(env.kind, ErrorKind::Unauthorized);
            }
            other => panic!("expected domain error, got {other:?}"),
        }
    }

    #[test]
    fn test_infra_error_collapses_to_internal_envelope() {
        let err = ActionError::UnknownAction("x.y".to_string());
        let env = err.envelope();

        assert_eq!(env.kind, ErrorKind::Internal);
        assert!(env.message.contains("x.y"));
    }
}
