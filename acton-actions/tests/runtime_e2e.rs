//! End-to-end scenarios for the action runtime over the in-memory broker.

use acton_actions::action::{action, ActionSettings, CronInterval};
use acton_actions::broker::{Broker, JobOptions, JobPayload, MemoryBroker, QueueEvent, RepeatOptions};
use acton_actions::dispatch::{
    call_action, cancel_scheduled_action, enqueue_action, execute_action, get_scheduled_job,
    make_module, schedule_action, CallInput,
};
use acton_actions::error::{ActionError, ErrorKind};
use acton_actions::queue::Queue;
use acton_actions::runtime::Runtime;
use acton_actions::testing::{echo_def, failing_def, hanging_def, test_module, CountingBroker};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn runtime_with_queue(broker: Arc<dyn Broker>) -> (Runtime, Arc<Queue>) {
    let queue = Arc::new(Queue::new(broker).with_execute_timeout(Duration::from_millis(300)));
    let runtime = Runtime::new();
    runtime.init(&[test_module()], Some(Arc::clone(&queue)));
    (runtime, queue)
}

#[tokio::test]
async fn sync_call_echoes_input() -> Result<()> {
    let runtime = Runtime::new();
    runtime.init(&[test_module()], None);

    let out = call_action(
        &runtime,
        &echo_def(),
        CallInput {
            context: json!({}),
            input: json!({"v": 1}),
        },
    )
    .await?;

    assert_eq!(out.data, json!({"v": 1}));
    assert_eq!(out.context, json!({}));
    Ok(())
}

#[tokio::test]
async fn scheduling_twice_reuses_queue_and_worker() -> Result<()> {
    let counting = Arc::new(CountingBroker::new(Arc::new(MemoryBroker::new())));
    let (runtime, queue) = runtime_with_queue(Arc::clone(&counting) as Arc<dyn Broker>);

    let first = schedule_action(
        &runtime,
        &echo_def(),
        CallInput {
            context: json!({}),
            input: json!({"v": 1}),
        },
        None,
    )
    .await?;
    let second = schedule_action(
        &runtime,
        &echo_def(),
        CallInput {
            context: json!({}),
            input: json!({"v": 2}),
        },
        None,
    )
    .await?;

    assert_ne!(first.job_id, second.job_id);
    // Two enqueues hit the broker...
    assert_eq!(counting.add_count(), 2);
    // ...but the queue handle and worker stayed memoized.
    let q1 = queue.get_or_create_q(echo_def().name()).await;
    let q2 = queue.get_or_create_q(echo_def().name()).await;
    assert!(Arc::ptr_eq(&q1, &q2));

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn schedule_rejects_past_times_without_enqueueing() -> Result<()> {
    let counting = Arc::new(CountingBroker::new(Arc::new(MemoryBroker::new())));
    let (runtime, _queue) = runtime_with_queue(Arc::clone(&counting) as Arc<dyn Broker>);

    let err = schedule_action(
        &runtime,
        &echo_def(),
        CallInput {
            context: json!({}),
            input: json!({"v": 1}),
        },
        Some(chrono::Utc::now() - chrono::Duration::seconds(5)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ActionError::ScheduleInPast(_)));
    assert_eq!(counting.add_count(), 0);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn delayed_schedule_runs_after_due_time() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (runtime, _queue) = runtime_with_queue(Arc::clone(&broker));
    let mut events = broker.subscribe(echo_def().name()).await?;

    let scheduled = schedule_action(
        &runtime,
        &echo_def(),
        CallInput {
            context: json!({}),
            input: json!({"v": 9}),
        },
        Some(chrono::Utc::now() + chrono::Duration::milliseconds(100)),
    )
    .await?;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
    match event {
        QueueEvent::Completed { job_id, .. } => assert_eq!(job_id, scheduled.job_id),
        other => panic!("unexpected event {other:?}"),
    }

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_pending_job_then_gone() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (runtime, _queue) = runtime_with_queue(broker);

    // Scheduled far enough out that no worker picks it up first.
    let scheduled = schedule_action(
        &runtime,
        &echo_def(),
        CallInput {
            context: json!({}),
            input: json!({"v": 1}),
        },
        Some(chrono::Utc::now() + chrono::Duration::seconds(3600)),
    )
    .await?;

    assert!(cancel_scheduled_action(&runtime, &echo_def(), scheduled.job_id).await);
    assert!(get_scheduled_job(&runtime, &echo_def(), scheduled.job_id)
        .await?
        .is_none());

    // Cancelling again reports false: the job no longer exists.
    assert!(!cancel_scheduled_action(&runtime, &echo_def(), scheduled.job_id).await);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn execute_times_out_and_clears_pending_entry() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (runtime, queue) = runtime_with_queue(broker);

    let started = std::time::Instant::now();
    let err = execute_action(
        &runtime,
        &hanging_def(),
        CallInput {
            context: json!({}),
            input: json!({}),
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ActionError::Timeout { .. }));
    // Rejected within the configured window, give or take scheduling slack.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(queue.pending_count(), 0);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn queued_failure_reconstructs_structured_error() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (runtime, queue) = runtime_with_queue(broker);

    let err = execute_action(
        &runtime,
        &failing_def(),
        CallInput {
            context: json!({}),
            input: json!({}),
        },
    )
    .await
    .unwrap_err();

    match err {
        ActionError::Domain(env) => {
            assert_eq!(env.kind, ErrorKind::Conflict);
            assert_eq!(env.message, "dup");
        }
        other => panic!("expected domain error, got {other:?}"),
    }
    assert_eq!(queue.pending_count(), 0);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn execute_round_trips_echo_reply() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (runtime, _queue) = runtime_with_queue(broker);

    let out = execute_action(
        &runtime,
        &echo_def(),
        CallInput {
            context: json!({"user": "u1"}),
            input: json!({"v": 3}),
        },
    )
    .await?;

    assert_eq!(out.data, json!({"v": 3}));
    assert_eq!(out.context, json!({"user": "u1"}));

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn enqueue_fire_and_forget_completes() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (runtime, _queue) = runtime_with_queue(Arc::clone(&broker));
    let mut events = broker.subscribe(echo_def().name()).await?;

    enqueue_action(
        &runtime,
        &echo_def(),
        CallInput {
            context: json!({}),
            input: json!({"v": 4}),
        },
    )
    .await?;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
    assert!(matches!(event, QueueEvent::Completed { .. }));

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn start_purges_stale_repeatables_before_arming_crons() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

    // Leftovers from a "previous deployment" on a queue this process never
    // registered.
    broker
        .add(
            "legacy.cleanup",
            JobPayload::empty(),
            JobOptions {
                repeat: Some(RepeatOptions {
                    pattern: "0 0 * * *".to_string(),
                }),
                ..JobOptions::default()
            },
        )
        .await?;

    let tree = acton_actions::action::group([(
        "nightly",
        action("reports.nightly")
            .with_settings(ActionSettings::cron(CronInterval::EveryDayAtMidnight))
            .into(),
    )]);
    let mut module = make_module("Reports", &tree);
    module.register_handlers(acton_actions::action::handler_group([(
        "nightly",
        acton_actions::action::handler(|args: acton_actions::action::ActionArgs| async move {
            Ok(acton_actions::action::ActionReply {
                data: serde_json::Value::Null,
                context: args.context,
            })
        }),
    )]))?;

    let queue = Arc::new(Queue::new(Arc::clone(&broker)));
    let runtime = Runtime::new();
    runtime.init(&[module], Some(Arc::clone(&queue)));
    runtime.start().await?;

    // Stale definition purged, current cron armed.
    assert!(broker.repeatable_jobs("legacy.cleanup").await?.is_empty());
    let armed = broker.repeatable_jobs("reports.nightly").await?;
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].pattern, "0 0 * * *");

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn testing_environment_skips_cron_arming() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let tree = acton_actions::action::group([(
        "nightly",
        action("reports.nightly")
            .with_settings(ActionSettings::cron(CronInterval::EveryDayAtMidnight))
            .into(),
    )]);
    let module = make_module("Reports", &tree);

    let queue = Arc::new(Queue::new(Arc::clone(&broker)));
    let runtime = Runtime::with_environment(acton_actions::config::Environment::Testing);
    runtime.init(&[module], Some(queue));
    runtime.start().await?;

    assert!(broker.repeatable_jobs("reports.nightly").await?.is_empty());

    runtime.shutdown().await;
    Ok(())
}
