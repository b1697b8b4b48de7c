//! Scheduler-wide lifecycle hooks.

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::task::ScheduledTask;
use serde_json::Value;
use tracing::{debug, error, info};

/// Hooks a scheduler calls around startup, shutdown and every firing.
///
/// Every method has a default that logs, so implementors only override what
/// they care about. Task-scoped hooks always run before the matching
/// scheduler-wide hook.
pub trait SchedulerLifecycle: Send + Sync {
    /// Register tasks. Called by [`Scheduler::configure`] and on restart.
    fn configure(&self, _scheduler: &Scheduler) {}

    /// Called after every task has been started.
    fn on_startup(&self, scheduler: &Scheduler) {
        info!(
            scheduler = %scheduler.name(),
            tasks = scheduler.len(),
            "Scheduler started"
        );
    }

    /// Called before the worker pool is torn down.
    fn on_shutdown(&self, scheduler: &Scheduler) {
        info!(scheduler = %scheduler.name(), "Scheduler shutting down");
    }

    /// Called after a firing failed.
    fn on_any_task_error(&self, task: &ScheduledTask, err: &SchedulerError) {
        error!(
            task = %task.name(),
            group = %task.group(),
            error = %err.chain(),
            "Task failed"
        );
    }

    /// Called after a firing succeeded.
    fn on_any_task_success(&self, task: &ScheduledTask, _result: Option<&Value>) {
        info!(task = %task.name(), group = %task.group(), "Task completed");
    }

    /// Called before every firing.
    fn before_any_task(&self, task: &ScheduledTask) {
        debug!(task = %task.name(), "Task starting");
    }

    /// Called after every firing, successful or not.
    fn after_any_task(&self, task: &ScheduledTask, _result: Option<&Value>) {
        debug!(task = %task.name(), "Task finished");
    }
}

/// Lifecycle with only the logging defaults and no tasks of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLifecycle;

impl SchedulerLifecycle for DefaultLifecycle {}

/// Lifecycle whose `configure` step is a closure.
///
/// Lets a scheduler be set up and restarted without a dedicated type.
pub struct ConfigureFn<F> {
    configure: F,
}

impl<F> ConfigureFn<F>
where
    F: Fn(&Scheduler) + Send + Sync,
{
    pub fn new(configure: F) -> Self {
        Self { configure }
    }
}

impl<F> SchedulerLifecycle for ConfigureFn<F>
where
    F: Fn(&Scheduler) + Send + Sync,
{
    fn configure(&self, scheduler: &Scheduler) {
        (self.configure)(scheduler)
    }
}
