//! acton-actions: action runtime with durable job queues, workers, and cron
//! scheduling.
//!
//! Application code defines named, typed **actions**, groups them into
//! nested namespaces, and registers handlers for them in **modules**. A
//! process-wide **runtime** aggregates every module's registry, binds a
//! **queue** over a durable broker (Redis in production, in-memory for
//! tests), and dispatches:
//!
//! - in-process for request/response calls ([`dispatch::call_action`])
//! - over the queue for background and delayed work
//!   ([`dispatch::schedule_action`], [`dispatch::enqueue_action`])
//! - on a recurring schedule for cron-eligible actions (armed by
//!   [`runtime::Runtime::start`])
//!
//! # Quick Start
//!
//! ```rust
//! use acton_actions::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Define actions and group them into a namespace.
//!     let greetings = group([("hello", action("greetings.hello").into())]);
//!
//!     // Build the module and attach handlers mirroring the group's shape.
//!     let mut module = make_module("Greetings", &greetings);
//!     module.register_handlers(handler_group([(
//!         "hello",
//!         handler(|args: ActionArgs| async move {
//!             Ok(ActionReply {
//!                 data: json!({ "greeting": "hello" }),
//!                 context: args.context,
//!             })
//!         }),
//!     )]))?;
//!
//!     // Initialize the runtime. Binding a queue enables queued dispatch;
//!     // without one, only the in-process path is available.
//!     let runtime = Runtime::new();
//!     runtime.init(&[module], None);
//!     runtime.start().await?;
//!
//!     // Call the action in-process.
//!     let out = call_action(
//!         &runtime,
//!         &action("greetings.hello"),
//!         CallInput {
//!             context: json!({}),
//!             input: json!({}),
//!         },
//!     )
//!     .await?;
//!     assert_eq!(out.data["greeting"], "hello");
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery model
//!
//! Queued dispatch is at-least-once: the request/response correlation path
//! enforces a fixed execution window and rejects the caller on expiry, but a
//! worker that already picked the job up will still run it to completion —
//! handlers with side effects should tolerate a completed execution whose
//! caller is gone.
//!
//! # Features
//!
//! - `redis` - Redis-backed durable broker (default)

// Lint configuration is handled at the workspace level in Cargo.toml
// Additional crate-specific allows:
#![allow(clippy::missing_errors_doc)]

pub mod action;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod module;
pub mod observability;
pub mod queue;
pub mod runtime;
pub mod testing;

pub mod prelude {
    //! Convenience re-exports for common types and functions
    //!
    //! ```rust
    //! use acton_actions::prelude::*;
    //! ```

    pub use crate::action::{
        action, group, handler, handler_group, ActionArgs, ActionDef, ActionNode, ActionReply,
        ActionSettings, CronInterval, HandlerNode, RetryPolicy,
    };
    pub use crate::broker::{Broker, Job, JobId, MemoryBroker};
    #[cfg(feature = "redis")]
    pub use crate::broker::RedisBroker;
    pub use crate::config::{ActionsConfig, Environment};
    pub use crate::dispatch::{
        call_action, cancel_scheduled_action, enqueue_action, execute_action, make_module,
        schedule_action, CallInput, CallOutput,
    };
    pub use crate::error::{ActionError, ActionResult, ErrorEnvelope, ErrorKind};
    pub use crate::module::Module;
    pub use crate::queue::{Queue, WorkerOptions};
    pub use crate::runtime::{run_until_shutdown, Runtime, ScheduleInput, ScheduledJob};
}
