//! Main scheduler implementation.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::handle::TaskHandle;
use crate::lifecycle::{DefaultLifecycle, SchedulerLifecycle};
use crate::pool::{PoolProvider, TokioPoolProvider, WorkerPool};
use crate::record::{TaskRecord, TaskRegistry, TaskStats};
use crate::task::ScheduledTask;
use crate::time::{parse_timezone, Clock, SystemClock};
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a forced shutdown waits for cancelled work to wind down.
const FORCED_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Owns a set of named tasks and the worker pool they run on.
///
/// `Scheduler` is a cheap handle: clones share the same registry, pool and
/// lifecycle. Tasks are registered with [`task`](Self::task) (usually from a
/// [`SchedulerLifecycle::configure`] implementation), then started together
/// by [`startup`](Self::startup).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    name: String,
    config: SchedulerConfig,
    timezone: RwLock<Tz>,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn PoolProvider>,
    lifecycle: Arc<dyn SchedulerLifecycle>,
    tasks: RwLock<TaskRegistry>,
    started: AtomicBool,
    pool: RwLock<Option<Arc<dyn WorkerPool>>>,
    // Serializes startup, shutdown and restart.
    transition: tokio::sync::Mutex<()>,
}

impl Scheduler {
    /// Create a new scheduler builder.
    pub fn builder(name: impl Into<String>) -> SchedulerBuilder {
        SchedulerBuilder::new(name)
    }

    /// Create a scheduler with default settings on the current tokio runtime.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::builder(name).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Timezone new tasks inherit.
    pub fn timezone(&self) -> Tz {
        *self.inner.timezone.read()
    }

    /// Change the timezone new tasks inherit. Registered tasks keep theirs.
    pub fn set_timezone(&self, timezone: Tz) -> &Self {
        *self.inner.timezone.write() = timezone;
        self
    }

    /// Like [`set_timezone`](Self::set_timezone), from an IANA name.
    pub fn set_timezone_name(&self, name: &str) -> Result<&Self> {
        Ok(self.set_timezone(parse_timezone(name)?))
    }

    pub fn has_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Pool acquired at startup, if the scheduler is running.
    pub fn pool(&self) -> Option<Arc<dyn WorkerPool>> {
        self.inner.pool.read().clone()
    }

    /// Name of the pool requested from the provider.
    pub fn pool_name(&self) -> String {
        format!("{}-scheduler", self.inner.name)
    }

    /// Check if both handles refer to the same scheduler.
    pub fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- registration ----

    /// Register a task in the default group and return it for configuration.
    ///
    /// Registering a name again replaces the earlier task and cancels its loop.
    pub fn task(&self, name: impl Into<String>) -> ScheduledTask {
        self.task_in_group(name, "")
    }

    /// Register a task in `group`.
    pub fn task_in_group(&self, name: impl Into<String>, group: impl Into<String>) -> ScheduledTask {
        let task = ScheduledTask::attached(
            name.into(),
            group.into(),
            Some(self.inner.name.clone()),
            self.timezone(),
            self.inner.clock.clone(),
            self.inner.lifecycle.clone(),
            self.inner.config.max_search_iterations,
        );
        let record = TaskRecord::new(task.clone(), self.inner.clock.now());
        let replaced = self.inner.tasks.write().insert(record);

        if let Some(mut old) = replaced {
            if old.cancel() {
                info!(scheduler = %self.inner.name, task = %task.name(), "Replaced running task");
            }
        }
        debug!(scheduler = %self.inner.name, task = %task.name(), "Task registered");
        task
    }

    /// Register a task that starts out disabled.
    pub fn xtask(&self, name: impl Into<String>) -> ScheduledTask {
        self.task(name).disable()
    }

    /// Register a disabled task in `group`.
    pub fn xtask_in_group(&self, name: impl Into<String>, group: impl Into<String>) -> ScheduledTask {
        self.task_in_group(name, group).disable()
    }

    /// Run the lifecycle's `configure` step, registering its tasks.
    pub fn configure(&self) -> &Self {
        self.inner.lifecycle.configure(self);
        self
    }

    // ---- lifecycle ----

    /// Acquire the worker pool and start every registered task.
    ///
    /// Does nothing if already started. A task that fails to start is flagged
    /// on its record and does not stop the others.
    pub async fn startup(&self) -> Result<&Self> {
        let _transition = self.inner.transition.lock().await;
        self.startup_locked()?;
        Ok(self)
    }

    fn startup_locked(&self) -> Result<()> {
        if self.has_started() {
            debug!(scheduler = %self.inner.name, "Scheduler already started");
            return Ok(());
        }

        let pool = self.inner.provider.new_named_pool(&self.pool_name())?;
        *self.inner.pool.write() = Some(pool.clone());

        // Snapshot so no registry lock is held while tasks start.
        let tasks: Vec<ScheduledTask> = self.inner.tasks.read().iter().map(|r| r.task.clone()).collect();
        for task in tasks {
            self.start_record(&task, &pool);
        }

        self.inner.started.store(true, Ordering::SeqCst);
        self.inner.lifecycle.on_startup(self);
        Ok(())
    }

    /// Start one task and write the outcome to its record.
    fn start_record(&self, task: &ScheduledTask, pool: &Arc<dyn WorkerPool>) -> Option<Result<TaskHandle>> {
        if task.is_disabled() {
            warn!(scheduler = %self.inner.name, task = %task.name(), "Task is disabled, not starting it");
            if let Some(record) = self.inner.tasks.write().get_mut(task.name()) {
                if record.task.same_as(task) {
                    record.mark_disabled();
                }
            }
            return None;
        }

        let outcome = task.start(pool);
        let mut tasks = self.inner.tasks.write();
        let record = tasks.get_mut(task.name()).filter(|record| record.task.same_as(task));
        match (record, &outcome) {
            (Some(record), Ok(handle)) => {
                record.mark_scheduled(handle.clone(), self.inner.clock.now());
            }
            (Some(record), Err(e)) => {
                error!(
                    scheduler = %self.inner.name,
                    task = %task.name(),
                    error = %e.chain(),
                    "Task failed to start"
                );
                record.mark_failed(e);
            }
            (None, Ok(handle)) => {
                // Removed or replaced while starting.
                debug!(scheduler = %self.inner.name, task = %task.name(), "Task no longer registered, cancelling it");
                handle.cancel();
            }
            (None, Err(_)) => {}
        }
        Some(outcome)
    }

    /// Graceful shutdown with the configured timeout.
    pub async fn shutdown(&self) -> &Self {
        self.shutdown_with(false, self.inner.config.shutdown_timeout()).await
    }

    /// Cancel everything in flight and shut down without waiting.
    pub async fn shutdown_now(&self) -> &Self {
        self.shutdown_with(true, Duration::ZERO).await
    }

    /// Shut down, forcibly or by draining the pool for up to `timeout`.
    pub async fn shutdown_with(&self, force: bool, timeout: Duration) -> &Self {
        let _transition = self.inner.transition.lock().await;
        self.shutdown_locked(force, timeout).await;
        self
    }

    async fn shutdown_locked(&self, force: bool, timeout: Duration) {
        if !self.has_started() && self.inner.pool.read().is_none() {
            debug!(scheduler = %self.inner.name, "Scheduler not running, nothing to shut down");
            return;
        }

        self.inner.lifecycle.on_shutdown(self);

        let pool = self.inner.pool.write().take();
        if let Some(pool) = pool {
            if force {
                pool.shutdown_now();
            } else if !pool.shutdown_and_await_termination(timeout).await {
                warn!(
                    scheduler = %self.inner.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Tasks still running after the shutdown timeout, forcing shutdown"
                );
                pool.shutdown_now();
                if !pool
                    .shutdown_and_await_termination(timeout.min(FORCED_SHUTDOWN_GRACE))
                    .await
                {
                    error!(scheduler = %self.inner.name, "Worker pool did not terminate");
                }
            }
            self.inner.provider.delete_pool(pool.name());
        }

        for record in self.inner.tasks.write().iter_mut() {
            record.cancel();
        }

        self.inner.started.store(false, Ordering::SeqCst);
        info!(scheduler = %self.inner.name, force, "Scheduler stopped");
    }

    /// Shut down, drop every task, run `configure` again and start up.
    pub async fn restart(&self, force: bool, timeout: Duration) -> Result<&Self> {
        let _transition = self.inner.transition.lock().await;
        info!(scheduler = %self.inner.name, force, "Restarting scheduler");
        self.shutdown_locked(force, timeout).await;
        self.clear_tasks();
        self.configure();
        self.startup_locked()?;
        Ok(self)
    }

    /// Start a task registered after [`startup`](Self::startup).
    pub async fn start_task(&self, name: &str) -> Result<TaskHandle> {
        let _transition = self.inner.transition.lock().await;
        let pool = self.pool().ok_or_else(|| {
            SchedulerError::Pool(format!("scheduler ({}) has not been started", self.inner.name))
        })?;
        let record = self.get_task_record(name)?;
        match self.start_record(&record.task, &pool) {
            Some(outcome) => outcome,
            None => Err(SchedulerError::Disabled(name.to_string())),
        }
    }

    // ---- registry ----

    /// Drop every task record. Loops are not cancelled here.
    pub fn clear_tasks(&self) -> &Self {
        let cleared = self.inner.tasks.write().clear();
        debug!(scheduler = %self.inner.name, count = cleared.len(), "Cleared tasks");
        self
    }

    /// Cancel a task's loop and remove its record.
    pub fn remove_task(&self, name: &str) -> Result<&Self> {
        let mut removed = {
            let mut tasks = self.inner.tasks.write();
            match tasks.remove(name) {
                Some(record) => record,
                None => {
                    return Err(SchedulerError::TaskNotFound {
                        name: name.to_string(),
                        registered: tasks.sorted_names(),
                    })
                }
            }
        };

        let was_live = removed.cancel();
        info!(scheduler = %self.inner.name, task = %name, cancelled = was_live, "Task removed");
        Ok(self)
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.inner.tasks.read().contains(name)
    }

    /// Snapshot of one task record.
    pub fn get_task_record(&self, name: &str) -> Result<TaskRecord> {
        let tasks = self.inner.tasks.read();
        tasks
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound {
                name: name.to_string(),
                registered: tasks.sorted_names(),
            })
    }

    /// Registered task names, sorted.
    pub fn registered_tasks(&self) -> Vec<String> {
        self.inner.tasks.read().sorted_names()
    }

    /// Snapshot of every record, in registration order.
    pub fn task_records(&self) -> Vec<TaskRecord> {
        self.inner.tasks.read().iter().cloned().collect()
    }

    /// Stats of every task, keyed by name.
    pub fn task_stats(&self) -> BTreeMap<String, TaskStats> {
        let tasks: Vec<ScheduledTask> = self.inner.tasks.read().iter().map(|r| r.task.clone()).collect();
        tasks
            .into_iter()
            .map(|task| (task.name().to_string(), task.stats()))
            .collect()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.inner.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("timezone", &self.timezone())
            .field("started", &self.has_started())
            .field("tasks", &self.registered_tasks())
            .finish()
    }
}

/// Builder for creating a scheduler.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    provider: Option<Arc<dyn PoolProvider>>,
    lifecycle: Option<Arc<dyn SchedulerLifecycle>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SchedulerBuilder {
    /// Create a new scheduler builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: SchedulerConfig::default().with_name(name),
            provider: None,
            lifecycle: None,
            clock: None,
        }
    }

    /// Replace the whole configuration, name included.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the timezone by IANA name.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.config = self.config.with_timezone(timezone);
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_shutdown_timeout_secs(timeout.as_secs());
        self
    }

    /// Set the calendar search bound.
    pub fn with_max_search_iterations(mut self, iterations: u32) -> Self {
        self.config = self.config.with_max_search_iterations(iterations);
        self
    }

    /// Use a custom pool provider.
    pub fn with_pool_provider(self, provider: impl PoolProvider + 'static) -> Self {
        self.with_shared_pool_provider(Arc::new(provider))
    }

    /// Use a pool provider shared with other schedulers.
    pub fn with_shared_pool_provider(mut self, provider: Arc<dyn PoolProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use custom lifecycle hooks.
    pub fn with_lifecycle(self, lifecycle: impl SchedulerLifecycle + 'static) -> Self {
        self.with_shared_lifecycle(Arc::new(lifecycle))
    }

    pub fn with_shared_lifecycle(mut self, lifecycle: Arc<dyn SchedulerLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Use a custom clock.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Build the scheduler.
    ///
    /// Without an explicit pool provider this must run inside a tokio runtime.
    pub fn build(self) -> Result<Scheduler> {
        let timezone = self.config.timezone()?;
        let provider = match self.provider {
            Some(provider) => provider,
            None => Arc::new(TokioPoolProvider::current()?),
        };

        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                name: self.config.name.clone(),
                timezone: RwLock::new(timezone),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                provider,
                lifecycle: self.lifecycle.unwrap_or_else(|| Arc::new(DefaultLifecycle)),
                tasks: RwLock::new(TaskRegistry::default()),
                started: AtomicBool::new(false),
                pool: RwLock::new(None),
                transition: tokio::sync::Mutex::new(()),
                config: self.config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_applies_config() {
        let scheduler = Scheduler::builder("reports")
            .with_timezone("Asia/Tokyo")
            .with_shutdown_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(scheduler.name(), "reports");
        assert_eq!(scheduler.pool_name(), "reports-scheduler");
        assert_eq!(scheduler.timezone(), chrono_tz::Asia::Tokyo);
        assert_eq!(scheduler.config().shutdown_timeout_secs, 5);
        assert!(!scheduler.has_started());
    }

    #[tokio::test]
    async fn test_unknown_timezone_fails_build() {
        let err = Scheduler::builder("bad").with_timezone("Atlantis/Central").build().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTimezone(_)));
    }

    #[tokio::test]
    async fn test_tasks_inherit_scheduler_timezone() {
        let scheduler = Scheduler::new("tz").unwrap();
        let before = scheduler.task("before");
        scheduler.set_timezone_name("Europe/Madrid").unwrap();
        let after = scheduler.task("after");

        assert_eq!(before.timezone(), Tz::UTC);
        assert_eq!(after.timezone(), chrono_tz::Europe::Madrid);
        assert_eq!(after.scheduler_name(), Some("tz"));
    }

    #[test]
    fn test_build_outside_runtime_needs_provider() {
        let err = Scheduler::builder("orphan").build().unwrap_err();
        assert!(matches!(err, SchedulerError::Pool(_)));
    }

    #[tokio::test]
    async fn test_replaced_task_does_not_inherit_old_loop() {
        let scheduler = Scheduler::new("swap").unwrap();
        let first = scheduler.task("job").every_hour().call(|_ctx| Ok(None));
        let second = scheduler.task("job").every_day().call(|_ctx| Ok(None));

        let pool = scheduler.inner.provider.new_named_pool(&scheduler.pool_name()).unwrap();
        let handle = scheduler.start_record(&first, &pool).unwrap().unwrap();

        assert!(handle.is_cancelled());
        let record = scheduler.get_task_record("job").unwrap();
        assert!(record.task.same_as(&second));
        assert!(record.future.is_none());
        assert!(record.scheduled_at.is_none());
        pool.shutdown_now();
    }

    #[tokio::test]
    async fn test_closed_gate_marks_calendar_record_failed() {
        let scheduler = Scheduler::new("gated").unwrap();
        scheduler
            .task("never")
            .every_day_at("09:00")
            .when(|_| false)
            .call(|_ctx| Ok(None));

        scheduler.startup().await.unwrap();
        let record = scheduler.get_task_record("never").unwrap();
        assert!(record.error);
        assert!(record.future.is_none());
        assert!(record.stats().next_run.is_none());
        scheduler.shutdown_now().await;
    }
}
