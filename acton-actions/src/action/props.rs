//! Handler invocation types and the dispatch-time decorator.
//!
//! Business handlers receive [`ActionArgs`]: the caller's context, the action
//! input, and three helpers scoped to the action name — a tracing span, an
//! error factory, and a cache-key builder. The helpers are injected at
//! dispatch time, never stored with the handler, so the business function
//! stays a plain async fn that is trivial to test in isolation.
//!
//! [`decorate`] is the boundary between "pure business handler" and
//! "broker-invokable job processor": it wraps a registered handler into a
//! function a worker can feed raw `{context, input}` payloads.

use super::cache_key::CacheKeyBuilder;
use crate::broker::JobPayload;
use crate::error::{ActionResult, ErrorFactory};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;

/// What a handler returns: output data plus the (possibly updated) context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReply {
    /// Output data, matching the action's output contract.
    pub data: Value,
    /// Caller context, forwarded or updated by the handler.
    pub context: Value,
}

/// Arguments passed to a handler on every invocation.
#[derive(Debug, Clone)]
pub struct ActionArgs {
    /// Opaque caller context.
    pub context: Value,
    /// Action input.
    pub input: Value,
    /// Span scoped to the action name; handler logs nest under it.
    pub span: tracing::Span,
    /// Error factory scoped to the action name.
    pub errors: ErrorFactory,
    /// Cache-key builder scoped to the action name.
    pub cache_key: CacheKeyBuilder,
}

/// Boxed future returned by type-erased handlers.
pub(crate) type HandlerFuture = BoxFuture<'static, ActionResult<ActionReply>>;

/// Type-erased action handler stored in module registries.
pub type ActionHandler = Arc<dyn Fn(ActionArgs) -> HandlerFuture + Send + Sync>;

/// A broker-invokable function: raw payload in, serialized reply out.
pub type JobProcessor =
    Arc<dyn Fn(JobPayload) -> BoxFuture<'static, ActionResult<Value>> + Send + Sync>;

/// Build the per-call helpers for an action name.
fn action_props(action: &str) -> (tracing::Span, ErrorFactory, CacheKeyBuilder) {
    let span = tracing::info_span!("action", name = %action);
    let errors = ErrorFactory::new(action);
    let cache_key = CacheKeyBuilder::new(action);
    (span, errors, cache_key)
}

/// Wrap a registered handler into a [`JobProcessor`].
///
/// Each invocation gets fresh scoped helpers; the handler's reply is
/// serialized to a JSON value for the broker's return-value channel. The
/// handler future runs inside the action span.
pub(crate) fn decorate(action: &str, handler: ActionHandler) -> JobProcessor {
    let action = action.to_string();
    Arc::new(move |payload: JobPayload| {
        let (span, errors, cache_key) = action_props(&action);
        let args = ActionArgs {
            context: payload.context,
            input: payload.input,
            span: span.clone(),
            errors,
            cache_key,
        };
        let fut = handler(args);
        Box::pin(
            async move {
                let reply = fut.await?;
                Ok(serde_json::to_value(reply)?)
            }
            .instrument(span),
        )
    })
}

/// Invoke a handler directly with fresh scoped helpers (the in-process path).
pub(crate) async fn invoke(
    action: &str,
    handler: &ActionHandler,
    context: Value,
    input: Value,
) -> ActionResult<ActionReply> {
    let (span, errors, cache_key) = action_props(action);
    let args = ActionArgs {
        context,
        input,
        span: span.clone(),
        errors,
        cache_key,
    };
    handler(args).instrument(span).await
}
