//! The developer-facing call/schedule façade.
//!
//! Application code talks to the runtime through these functions:
//!
//! - [`call_action`] always executes in-process, regardless of the
//!   definition's async hint — the hint is informational.
//! - [`schedule_action`] / [`enqueue_action`] always go through the queue.
//! - [`execute_action`] enqueues and awaits the result over the queue's
//!   event stream (request/response correlation).
//! - [`cancel_scheduled_action`] is best-effort and returns a `bool`.
//!
//! Input and output contracts are checked here, at the boundary, when the
//! action's settings ask for it (the default).

use crate::action::{ActionDef, ActionNode};
use crate::broker::{Job, JobId};
use crate::error::{ActionError, ActionResult};
use crate::module::Module;
use crate::runtime::{Runtime, ScheduleInput, ScheduledJob};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Input to a call: the caller's context plus the action input.
#[derive(Debug, Clone, Default)]
pub struct CallInput {
    /// Opaque caller context.
    pub context: Value,
    /// Action input, matching the input contract.
    pub input: Value,
}

/// Output of a call: the handler's data plus the returned context.
pub type CallOutput = crate::action::ActionReply;

/// Make an action module from a name and a group definition.
#[must_use]
pub fn make_module(name: impl Into<String>, group: &ActionNode) -> Module {
    Module::new(name, group)
}

/// Call an action and await the result in-process.
///
/// # Errors
///
/// Boundary validation errors, [`ActionError::NoHandler`] when nothing is
/// registered, or whatever the handler raised.
pub async fn call_action(
    runtime: &Runtime,
    def: &ActionDef,
    input: CallInput,
) -> ActionResult<CallOutput> {
    check_input(def, &input.input)?;
    let reply = runtime
        .run_handler(def.name(), input.context, input.input)
        .await?;
    check_output(def, &reply.data)?;
    Ok(reply)
}

/// Call an action through the queue and await its result over the event
/// stream.
///
/// Unlike [`call_action`] this pays the broker round-trip and is subject to
/// the correlation timeout; use it when the work must run on the queue's
/// worker pool but the caller still needs the reply.
///
/// # Errors
///
/// The reconstructed domain error, a timeout error, or the registration and
/// connection errors of the schedule path.
pub async fn execute_action(
    runtime: &Runtime,
    def: &ActionDef,
    input: CallInput,
) -> ActionResult<CallOutput> {
    check_input(def, &input.input)?;
    runtime.execute_job(def, input.context, input.input).await
}

/// Add an action to the queue fire-and-forget.
///
/// # Errors
///
/// Boundary validation errors, or the registration and connection errors of
/// the schedule path.
pub async fn enqueue_action(
    runtime: &Runtime,
    def: &ActionDef,
    input: CallInput,
) -> ActionResult<()> {
    check_input(def, &input.input)?;
    runtime
        .enqueue_job(def, input.context, input.input)
        .await
        .map(|_| ())
}

/// Schedule an action for queued execution, optionally at a future instant.
///
/// # Errors
///
/// [`ActionError::ScheduleInPast`] when `scheduled_at` is not strictly in
/// the future, plus the registration and connection errors of the schedule
/// path.
pub async fn schedule_action(
    runtime: &Runtime,
    def: &ActionDef,
    input: CallInput,
    scheduled_at: Option<DateTime<Utc>>,
) -> ActionResult<ScheduledJob> {
    check_input(def, &input.input)?;
    runtime
        .schedule_job(
            def,
            ScheduleInput {
                context: input.context,
                input: input.input,
                scheduled_at,
            },
        )
        .await
}

/// Cancel a previously scheduled job. Returns `false` when the job cannot
/// be cancelled (unknown, already active, or finished) — an expected
/// outcome, not an error.
pub async fn cancel_scheduled_action(runtime: &Runtime, def: &ActionDef, job_id: JobId) -> bool {
    runtime.cancel_scheduled_job(def.name(), job_id).await
}

/// The broker job handle for a scheduled action, when it still exists.
///
/// # Errors
///
/// [`ActionError::QueueNotBound`] without a queue; broker failures otherwise.
pub async fn get_scheduled_job(
    runtime: &Runtime,
    def: &ActionDef,
    job_id: JobId,
) -> ActionResult<Option<Job>> {
    let queue = runtime.queue().ok_or(ActionError::QueueNotBound)?;
    let handle = queue.get_or_create_q(def.name()).await;
    Ok(handle.get_job(job_id).await?)
}

fn check_input(def: &ActionDef, input: &Value) -> ActionResult<()> {
    let validate = def.settings().is_none_or(|s| s.validate_input);
    if validate {
        def.check_input(input)
            .map_err(|detail| ActionError::Validation {
                action: def.name().to_string(),
                detail,
            })?;
    }
    Ok(())
}

fn check_output(def: &ActionDef, output: &Value) -> ActionResult<()> {
    let validate = def.settings().is_none_or(|s| s.validate_output);
    if validate {
        def.check_output(output)
            .map_err(|detail| ActionError::Validation {
                action: def.name().to_string(),
                detail,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{action, group, handler, handler_group, ActionArgs, ActionReply};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Echo {
        #[allow(dead_code)]
        v: i64,
    }

    fn echo_runtime() -> Runtime {
        let tree = group([(
            "echo",
            action("test.echo").input_of::<Echo>().into(),
        )]);
        let mut module = make_module("Test", &tree);
        module
            .register_handlers(handler_group([(
                "echo",
                handler(|args: ActionArgs| async move {
                    Ok(ActionReply {
                        data: args.input,
                        context: args.context,
                    })
                }),
            )]))
            .unwrap();

        let runtime = Runtime::new();
        runtime.init(&[module], None);
        runtime
    }

    #[tokio::test]
    async fn test_call_action_runs_in_process_without_queue() {
        let runtime = echo_runtime();
        let out = call_action(
            &runtime,
            &action("test.echo").input_of::<Echo>(),
            CallInput {
                context: json!({}),
                input: json!({"v": 1}),
            },
        )
        .await
        .unwrap();

        assert_eq!(out.data, json!({"v": 1}));
        assert_eq!(out.context, json!({}));
    }

    #[tokio::test]
    async fn test_call_action_validates_input_at_boundary() {
        let runtime = echo_runtime();
        let err = call_action(
            &runtime,
            &action("test.echo").input_of::<Echo>(),
            CallInput {
                context: json!({}),
                input: json!({"v": "not a number"}),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ActionError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_schedule_action_without_queue_fails_loudly() {
        let runtime = echo_runtime();
        let err = schedule_action(
            &runtime,
            &action("test.echo").input_of::<Echo>(),
            CallInput {
                context: json!({}),
                input: json!({"v": 1}),
            },
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ActionError::QueueNotBound));
    }

    #[tokio::test]
    async fn test_call_unregistered_action_reports_no_handler() {
        let runtime = echo_runtime();
        let err = call_action(
            &runtime,
            &action("test.missing"),
            CallInput::default(),
        )
        .await
        .unwrap_err();

        match err {
            ActionError::NoHandler { name, .. } => assert_eq!(name, "test.missing"),
            other => panic!("expected NoHandler, got {other:?}"),
        }
    }
}
