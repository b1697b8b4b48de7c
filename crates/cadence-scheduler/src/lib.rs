//! Cadence Scheduler
//!
//! An in-process task scheduler with calendar constraints, overlap control
//! and coordinated startup, shutdown and restart.
//!
//! # Overview
//!
//! The scheduler provides:
//! - One-shot tasks after a delay
//! - Fixed-rate and fixed-delay repetition
//! - Calendar tasks (daily, weekly, monthly, yearly, business days, weekends)
//! - Time-of-day and absolute validity windows in any IANA timezone
//! - Per-task and scheduler-wide hooks
//! - Per-task run statistics
//!
//! # Architecture
//!
//! 1. **Scheduler**: owns an ordered registry of task records and a worker pool
//!    obtained from a [`PoolProvider`] at startup
//! 2. **ScheduledTask**: the task definition, built with a fluent API
//! 3. **TimeWindowEvaluator**: decides whether a task may fire and when it fires next
//! 4. **Scheduling loops**: one per started task, running on the worker pool
//! 5. **Lifecycle hooks**: [`SchedulerLifecycle`], or a [`SchedulerDelegate`] target
//!
//! # Example
//!
//! ```ignore
//! use cadence_scheduler::prelude::*;
//! use serde_json::json;
//!
//! struct Reports;
//!
//! impl SchedulerLifecycle for Reports {
//!     fn configure(&self, scheduler: &Scheduler) {
//!         scheduler
//!             .task("daily-report")
//!             .call(|ctx| Ok(Some(json!({ "run": ctx.run_number }))))
//!             .on_weekdays("06:00");
//!
//!         scheduler
//!             .task("heartbeat")
//!             .call(|_ctx| Ok(None))
//!             .every(30, TimeUnit::Seconds);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scheduler = Scheduler::builder("reports")
//!         .with_timezone("Europe/London")
//!         .with_lifecycle(Reports)
//!         .build()?;
//!
//!     scheduler.configure().startup().await?;
//!     // ...
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delegate;
pub mod error;
pub mod evaluator;
mod execution;
pub mod handle;
pub mod invocable;
pub mod lifecycle;
pub mod pool;
pub mod record;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod task;
pub mod time;

pub mod prelude;

// Re-export main types
pub use config::SchedulerConfig;
pub use delegate::{DelegateTarget, DelegatingLifecycle, Hook, HookSet, SchedulerDelegate};
pub use error::{Result, SchedulerError};
pub use evaluator::TimeWindowEvaluator;
pub use handle::TaskHandle;
pub use invocable::{Invocable, MethodTable, TaskContext, TaskResult, DEFAULT_METHOD};
pub use lifecycle::{ConfigureFn, DefaultLifecycle, SchedulerLifecycle};
pub use pool::{PoolProvider, TokioPool, TokioPoolProvider, WorkerPool};
pub use record::{TaskRecord, TaskStats};
pub use schedule::{Constraints, TimingMode};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use service::SchedulerService;
pub use task::{FireOutcome, ScheduledTask};
pub use time::{Clock, SystemClock, TimeUnit};
