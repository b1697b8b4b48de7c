//! Scheduled task definition, fluent builder and firing algorithm.
//!
//! A [`ScheduledTask`] is a cheap, clonable handle. Builder methods consume and
//! return it so a task reads as one chain:
//!
//! ```ignore
//! scheduler
//!     .task("nightly-report")
//!     .call(|ctx| build_report(ctx))
//!     .on_weekdays("02:30")
//!     .with_no_overlaps();
//! ```
//!
//! Builder methods cannot fail mid-chain. A bad argument or a second,
//! conflicting timing mode is recorded on the task and reported by
//! [`ScheduledTask::start`] as a configuration error.

use crate::error::{Result, SchedulerError};
use crate::evaluator::{TimeWindowEvaluator, DEFAULT_MAX_ITERATIONS};
use crate::execution;
use crate::handle::TaskHandle;
use crate::invocable::{Invocable, TaskContext, TaskResult, DEFAULT_METHOD};
use crate::lifecycle::{DefaultLifecycle, SchedulerLifecycle};
use crate::pool::WorkerPool;
use crate::record::TaskStats;
use crate::schedule::{Constraints, TimingMode};
use crate::time::{localize, parse_date, parse_time, parse_timezone, Clock, SystemClock, TimeUnit};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hook run before a firing.
pub type BeforeHook = Arc<dyn Fn(&ScheduledTask) + Send + Sync>;
/// Hook run with the result of a firing. `None` after a failure or an empty result.
pub type ResultHook = Arc<dyn Fn(&ScheduledTask, Option<&Value>) + Send + Sync>;
/// Hook run after a failed firing.
pub type FailureHook = Arc<dyn Fn(&ScheduledTask, &SchedulerError) + Send + Sync>;
/// Predicate checked at every firing. `false` skips the firing.
pub type Gate = Arc<dyn Fn(&ScheduledTask) -> bool + Send + Sync>;

/// What happened to a single firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Disabled, outside its constraints, or gated off.
    Skipped,
    Succeeded,
    Failed,
}

/// Repetition requested through the builder, resolved into a [`TimingMode`]
/// when the task starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repeat {
    Rate(u64, TimeUnit),
    Spaced(u64, TimeUnit),
    Calendar,
}

impl Repeat {
    fn label(self) -> &'static str {
        match self {
            Self::Rate(..) => "fixed-rate",
            Self::Spaced(..) => "fixed-delay",
            Self::Calendar => "calendar",
        }
    }

    fn same_kind(self, other: Repeat) -> bool {
        std::mem::discriminant(&self) == std::mem::discriminant(&other)
    }
}

#[derive(Clone)]
struct TaskSettings {
    target: Option<Arc<dyn Invocable>>,
    method: String,
    repeat: Option<Repeat>,
    delay: Option<(u64, TimeUnit)>,
    constraints: Constraints,
    gate: Option<Gate>,
    before: Option<BeforeHook>,
    after: Option<ResultHook>,
    on_success: Option<ResultHook>,
    on_failure: Option<FailureHook>,
    disabled: bool,
    no_overlaps: bool,
    debug: bool,
    timezone: Tz,
    meta: BTreeMap<String, Value>,
    pending_error: Option<String>,
}

impl TaskSettings {
    fn new(timezone: Tz) -> Self {
        Self {
            target: None,
            method: DEFAULT_METHOD.to_string(),
            repeat: None,
            delay: None,
            constraints: Constraints::default(),
            gate: None,
            before: None,
            after: None,
            on_success: None,
            on_failure: None,
            disabled: false,
            no_overlaps: false,
            debug: false,
            timezone,
            meta: BTreeMap::new(),
            pending_error: None,
        }
    }

    fn set_repeat(&mut self, repeat: Repeat) -> std::result::Result<(), String> {
        match self.repeat {
            Some(existing) if !existing.same_kind(repeat) => Err(format!(
                "conflicting timing modes: {} and {}",
                existing.label(),
                repeat.label()
            )),
            _ => {
                self.repeat = Some(repeat);
                Ok(())
            }
        }
    }
}

/// Everything a scheduling loop needs, fixed at start.
#[derive(Debug, Clone)]
pub(crate) struct TaskPlan {
    pub(crate) mode: TimingMode,
    pub(crate) constraints: Constraints,
    pub(crate) timezone: Tz,
    pub(crate) evaluator: TimeWindowEvaluator,
}

impl TaskPlan {
    /// Next eligible instant after `after`. With `gated`, a candidate must also
    /// pass the task's gate.
    pub(crate) fn next_after(
        &self,
        task: &ScheduledTask,
        after: DateTime<Utc>,
        gated: bool,
    ) -> Result<DateTime<Utc>> {
        let gate = if gated { task.gate() } else { None };
        self.evaluator
            .next_eligible(
                task.name(),
                &self.mode,
                &self.constraints,
                after.with_timezone(&self.timezone),
                || task.check_gate(gate.as_ref()),
            )
            .map(|next| next.with_timezone(&Utc))
    }

    /// Check if the absolute validity window closed before `now`.
    pub(crate) fn has_ended(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone).naive_local();
        self.constraints.end_on.is_some_and(|end| local > end)
    }
}

struct TaskInner {
    name: String,
    group: String,
    scheduler: Option<String>,
    lifecycle: Arc<dyn SchedulerLifecycle>,
    clock: Arc<dyn Clock>,
    max_search_iterations: u32,
    settings: RwLock<TaskSettings>,
    stats: RwLock<TaskStats>,
    current: Mutex<Option<TaskHandle>>,
    started: AtomicBool,
}

/// A named unit of work and the rules for when it fires.
#[derive(Clone)]
pub struct ScheduledTask {
    inner: Arc<TaskInner>,
}

impl ScheduledTask {
    /// Create a standalone task in the default group, using UTC and the system clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self::in_group(name, "")
    }

    /// Create a standalone task in `group`.
    pub fn in_group(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self::attached(
            name.into(),
            group.into(),
            None,
            Tz::UTC,
            Arc::new(SystemClock),
            Arc::new(DefaultLifecycle),
            DEFAULT_MAX_ITERATIONS,
        )
    }

    /// Create a task owned by a scheduler.
    pub(crate) fn attached(
        name: String,
        group: String,
        scheduler: Option<String>,
        timezone: Tz,
        clock: Arc<dyn Clock>,
        lifecycle: Arc<dyn SchedulerLifecycle>,
        max_search_iterations: u32,
    ) -> Self {
        let stats = TaskStats::new(&name, &group, clock.now());
        Self {
            inner: Arc::new(TaskInner {
                name,
                group,
                scheduler,
                lifecycle,
                clock,
                max_search_iterations,
                settings: RwLock::new(TaskSettings::new(timezone)),
                stats: RwLock::new(stats),
                current: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    // ---- accessors ----

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Name of the owning scheduler, if any.
    pub fn scheduler_name(&self) -> Option<&str> {
        self.inner.scheduler.as_deref()
    }

    /// Entry point invoked on the target.
    pub fn method(&self) -> String {
        self.inner.settings.read().method.clone()
    }

    pub fn has_target(&self) -> bool {
        self.inner.settings.read().target.is_some()
    }

    pub fn timezone(&self) -> Tz {
        self.inner.settings.read().timezone
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.settings.read().disabled
    }

    pub fn is_no_overlaps(&self) -> bool {
        self.inner.settings.read().no_overlaps
    }

    pub fn is_debug(&self) -> bool {
        self.inner.settings.read().debug
    }

    /// Check if `start()` succeeded at least once. Timing is frozen afterwards.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Copy of the configured constraints.
    pub fn constraints(&self) -> Constraints {
        self.inner.settings.read().constraints.clone()
    }

    /// Copy of the metadata map.
    pub fn meta(&self) -> BTreeMap<String, Value> {
        self.inner.settings.read().meta.clone()
    }

    /// A single metadata value.
    pub fn meta_value(&self, key: &str) -> Option<Value> {
        self.inner.settings.read().meta.get(key).cloned()
    }

    /// Consistent snapshot of the run statistics.
    pub fn stats(&self) -> TaskStats {
        self.inner.stats.read().clone()
    }

    /// Handle of the current scheduling loop.
    pub fn handle(&self) -> Option<TaskHandle> {
        self.inner.current.lock().clone()
    }

    fn live_handle(&self) -> Option<TaskHandle> {
        self.handle().filter(TaskHandle::is_live)
    }

    /// Whether both values refer to the same task.
    pub fn same_as(&self, other: &ScheduledTask) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The timing mode `start()` would use.
    pub fn timing_mode(&self) -> Result<TimingMode> {
        let settings = self.inner.settings.read().clone();
        Ok(self.plan(&settings)?.mode)
    }

    // ---- builder: target, hooks and flags ----

    fn update(self, f: impl FnOnce(&mut TaskSettings)) -> Self {
        f(&mut self.inner.settings.write());
        self
    }

    /// Timing changes are ignored once the task has started.
    fn update_timing(
        self,
        call: &str,
        f: impl FnOnce(&mut TaskSettings) -> std::result::Result<(), String>,
    ) -> Self {
        if self.is_started() {
            warn!(task = %self.inner.name, call, "Ignoring timing change on a started task");
            return self;
        }
        {
            let mut settings = self.inner.settings.write();
            if settings.debug {
                debug!(task = %self.inner.name, call, "Configuring task timing");
            }
            if let Err(message) = f(&mut settings) {
                warn!(task = %self.inner.name, call, error = %message, "Invalid task configuration");
                settings.pending_error.get_or_insert(message);
            }
        }
        self
    }

    /// Call `target` on every firing.
    pub fn call<F>(self, target: F) -> Self
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        self.call_shared(Arc::new(target), DEFAULT_METHOD)
    }

    /// Call the default entry point of an [`Invocable`].
    pub fn call_invocable(self, target: impl Invocable + 'static) -> Self {
        self.call_shared(Arc::new(target), DEFAULT_METHOD)
    }

    /// Call the entry point `method` of an [`Invocable`].
    pub fn call_method(self, target: impl Invocable + 'static, method: impl Into<String>) -> Self {
        self.call_shared(Arc::new(target), method)
    }

    /// Call `method` on a target shared with other tasks.
    pub fn call_shared(self, target: Arc<dyn Invocable>, method: impl Into<String>) -> Self {
        let method = method.into();
        self.update(|s| {
            s.target = Some(target);
            s.method = method;
        })
    }

    pub fn before<F>(self, hook: F) -> Self
    where
        F: Fn(&ScheduledTask) + Send + Sync + 'static,
    {
        self.update(|s| s.before = Some(Arc::new(hook)))
    }

    pub fn after<F>(self, hook: F) -> Self
    where
        F: Fn(&ScheduledTask, Option<&Value>) + Send + Sync + 'static,
    {
        self.update(|s| s.after = Some(Arc::new(hook)))
    }

    pub fn on_success<F>(self, hook: F) -> Self
    where
        F: Fn(&ScheduledTask, Option<&Value>) + Send + Sync + 'static,
    {
        self.update(|s| s.on_success = Some(Arc::new(hook)))
    }

    pub fn on_failure<F>(self, hook: F) -> Self
    where
        F: Fn(&ScheduledTask, &SchedulerError) + Send + Sync + 'static,
    {
        self.update(|s| s.on_failure = Some(Arc::new(hook)))
    }

    /// Only fire while `gate` returns true. Checked at every firing.
    pub fn when<F>(self, gate: F) -> Self
    where
        F: Fn(&ScheduledTask) -> bool + Send + Sync + 'static,
    {
        self.update(|s| s.gate = Some(Arc::new(gate)))
    }

    pub fn disable(self) -> Self {
        self.set_disabled(true);
        self
    }

    pub fn enable(self) -> Self {
        self.set_disabled(false);
        self
    }

    /// Flip the disabled flag. A running task skips firings while disabled.
    pub fn set_disabled(&self, disabled: bool) {
        self.inner.settings.write().disabled = disabled;
    }

    /// Never run two firings of this task at the same time.
    pub fn with_no_overlaps(self) -> Self {
        self.update_timing("with_no_overlaps", |s| {
            s.no_overlaps = true;
            Ok(())
        })
    }

    /// Trace builder calls and firings at debug level.
    pub fn debug(self, enabled: bool) -> Self {
        self.update(|s| s.debug = enabled)
    }

    pub fn set_timezone(self, timezone: Tz) -> Self {
        self.update_timing("set_timezone", |s| {
            s.timezone = timezone;
            Ok(())
        })
    }

    /// Set the timezone from an IANA name such as `"Europe/Paris"`.
    pub fn set_timezone_name(self, name: &str) -> Self {
        self.update_timing("set_timezone_name", |s| {
            s.timezone = parse_timezone(name).map_err(|e| e.to_string())?;
            Ok(())
        })
    }

    pub fn set_meta_key(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.update(|s| {
            s.meta.insert(key, value);
        })
    }

    pub fn delete_meta_key(self, key: &str) -> Self {
        self.update(|s| {
            s.meta.remove(key);
        })
    }

    /// Replace the metadata map.
    pub fn with_meta(self, meta: BTreeMap<String, Value>) -> Self {
        self.update(|s| s.meta = meta)
    }

    // ---- builder: interval modes ----

    /// Wait before firing. Alone, the task fires once. Combined with a
    /// repeating mode, this is the wait before the first firing.
    pub fn delay(self, amount: u64, unit: TimeUnit) -> Self {
        self.delay_with(amount, unit, true)
    }

    /// Like [`delay`](Self::delay), but keeps an earlier delay unless `overwrite`.
    pub fn delay_with(self, amount: u64, unit: TimeUnit, overwrite: bool) -> Self {
        self.update_timing("delay", |s| {
            if overwrite || s.delay.is_none() {
                s.delay = Some((amount, unit));
            }
            Ok(())
        })
    }

    /// Fire every `period`, measured from each start.
    pub fn every(self, period: u64, unit: TimeUnit) -> Self {
        self.update_timing("every", |s| s.set_repeat(Repeat::Rate(period, unit)))
    }

    /// Fire `amount` after each firing completes.
    pub fn spaced_delay(self, amount: u64, unit: TimeUnit) -> Self {
        self.update_timing("spaced_delay", |s| s.set_repeat(Repeat::Spaced(amount, unit)))
    }

    pub fn every_minute(self) -> Self {
        self.every(1, TimeUnit::Minutes)
    }

    pub fn every_hour(self) -> Self {
        self.every(1, TimeUnit::Hours)
    }

    /// Fire every hour at `minute` past the hour.
    pub fn every_hour_at(self, minute: u32) -> Self {
        let now = self.inner.clock.now();
        self.update_timing("every_hour_at", |s| {
            if minute > 59 {
                return Err(format!("minute must be between 0 and 59, got {minute}"));
            }
            let local = now.with_timezone(&s.timezone);
            let elapsed_ms = i64::from(local.minute() * 60 + local.second()) * 1_000
                + i64::from(local.nanosecond() / 1_000_000);
            let wait_ms = (i64::from(minute) * 60_000 - elapsed_ms).rem_euclid(3_600_000);
            s.delay = Some((wait_ms as u64, TimeUnit::Milliseconds));
            s.set_repeat(Repeat::Rate(1, TimeUnit::Hours))
        })
    }

    // ---- builder: calendar mode ----

    fn calendar(
        self,
        call: &str,
        f: impl FnOnce(&mut Constraints) -> std::result::Result<(), String>,
    ) -> Self {
        self.update_timing(call, |s| {
            s.set_repeat(Repeat::Calendar)?;
            f(&mut s.constraints)
        })
    }

    fn calendar_at(
        self,
        call: &str,
        time: &str,
        f: impl FnOnce(&mut Constraints) -> std::result::Result<(), String>,
    ) -> Self {
        let parsed = parse_time(time).map_err(|e| e.to_string());
        self.calendar(call, |c| {
            c.task_time = Some(parsed?);
            f(c)
        })
    }

    /// Fire once a day at midnight, or at the window start if one is set.
    pub fn every_day(self) -> Self {
        self.calendar("every_day", |_| Ok(()))
    }

    /// Fire once a day at `time` (`HH:mm`).
    pub fn every_day_at(self, time: &str) -> Self {
        self.calendar_at("every_day_at", time, |_| Ok(()))
    }

    /// Fire on Sundays at midnight.
    pub fn every_week(self) -> Self {
        self.calendar("every_week", |c| {
            c.day_of_week = 7;
            Ok(())
        })
    }

    /// Fire on ISO weekday `day` (1 = Monday, 7 = Sunday) at `time`.
    pub fn every_week_on(self, day: u32, time: &str) -> Self {
        self.calendar_at("every_week_on", time, |c| {
            if !(1..=7).contains(&day) {
                return Err(format!("day of the week must be between 1 and 7, got {day}"));
            }
            c.day_of_week = day;
            Ok(())
        })
    }

    pub fn on_mondays(self, time: &str) -> Self {
        self.every_week_on(1, time)
    }

    pub fn on_tuesdays(self, time: &str) -> Self {
        self.every_week_on(2, time)
    }

    pub fn on_wednesdays(self, time: &str) -> Self {
        self.every_week_on(3, time)
    }

    pub fn on_thursdays(self, time: &str) -> Self {
        self.every_week_on(4, time)
    }

    pub fn on_fridays(self, time: &str) -> Self {
        self.every_week_on(5, time)
    }

    pub fn on_saturdays(self, time: &str) -> Self {
        self.every_week_on(6, time)
    }

    pub fn on_sundays(self, time: &str) -> Self {
        self.every_week_on(7, time)
    }

    /// Fire on the first of every month at midnight.
    pub fn every_month(self) -> Self {
        self.calendar("every_month", |c| {
            c.day_of_month = 1;
            Ok(())
        })
    }

    /// Fire on day `day` of every month at `time`. Months without that day are skipped.
    pub fn every_month_on(self, day: u32, time: &str) -> Self {
        self.calendar_at("every_month_on", time, |c| {
            if !(1..=31).contains(&day) {
                return Err(format!("day of the month must be between 1 and 31, got {day}"));
            }
            c.day_of_month = day;
            Ok(())
        })
    }

    pub fn on_first_business_day_of_the_month(self, time: &str) -> Self {
        self.calendar_at("on_first_business_day_of_the_month", time, |c| {
            c.first_business_day = true;
            Ok(())
        })
    }

    pub fn on_last_business_day_of_the_month(self, time: &str) -> Self {
        self.calendar_at("on_last_business_day_of_the_month", time, |c| {
            c.last_business_day = true;
            Ok(())
        })
    }

    /// Fire on January 1st at midnight.
    pub fn every_year(self) -> Self {
        self.calendar("every_year", |c| {
            c.annually = true;
            c.month_of_year = 1;
            c.day_of_month = 1;
            Ok(())
        })
    }

    /// Fire once a year on `month`/`day` at `time`.
    pub fn every_year_on(self, month: u32, day: u32, time: &str) -> Self {
        self.calendar_at("every_year_on", time, |c| {
            if !(1..=12).contains(&month) {
                return Err(format!("month must be between 1 and 12, got {month}"));
            }
            if !(1..=31).contains(&day) {
                return Err(format!("day of the month must be between 1 and 31, got {day}"));
            }
            c.annually = true;
            c.month_of_year = month;
            c.day_of_month = day;
            Ok(())
        })
    }

    pub fn on_weekends(self, time: &str) -> Self {
        self.calendar_at("on_weekends", time, |c| {
            c.weekends_only = true;
            Ok(())
        })
    }

    pub fn on_weekdays(self, time: &str) -> Self {
        self.calendar_at("on_weekdays", time, |c| {
            c.weekdays_only = true;
            Ok(())
        })
    }

    // ---- builder: windows ----

    /// First instant the task may fire (`yyyy-MM-dd`, `HH:mm`).
    pub fn start_on(self, date: &str, time: &str) -> Self {
        let at = parse_date_time(date, time);
        self.update_timing("start_on", |s| {
            s.constraints.start_on = Some(at?);
            Ok(())
        })
    }

    /// Last instant the task may fire (`yyyy-MM-dd`, `HH:mm`).
    pub fn end_on(self, date: &str, time: &str) -> Self {
        let at = parse_date_time(date, time);
        self.update_timing("end_on", |s| {
            s.constraints.end_on = Some(at?);
            Ok(())
        })
    }

    /// Earliest time of day the task may fire.
    pub fn start_on_time(self, time: &str) -> Self {
        let parsed = parse_time(time).map_err(|e| e.to_string());
        self.update_timing("start_on_time", |s| {
            s.constraints.start_time = Some(parsed?);
            Ok(())
        })
    }

    /// Latest time of day the task may fire.
    pub fn end_on_time(self, time: &str) -> Self {
        let parsed = parse_time(time).map_err(|e| e.to_string());
        self.update_timing("end_on_time", |s| {
            s.constraints.end_time = Some(parsed?);
            Ok(())
        })
    }

    /// Time-of-day window. An `end` before `start` wraps midnight.
    pub fn between(self, start: &str, end: &str) -> Self {
        self.start_on_time(start).end_on_time(end)
    }

    // ---- start and firing ----

    fn plan(&self, settings: &TaskSettings) -> Result<TaskPlan> {
        settings.constraints.validate()?;

        let initial_delay = settings
            .delay
            .map(|(amount, unit)| unit.to_duration(amount))
            .unwrap_or_default();

        let mode = match settings.repeat {
            None => {
                let (delay, unit) = settings.delay.unwrap_or((0, TimeUnit::Milliseconds));
                TimingMode::OneShotDelay { delay, unit }
            }
            Some(Repeat::Rate(period, unit)) if settings.no_overlaps => TimingMode::FixedDelay {
                spaced_delay: period,
                unit,
                initial_delay,
            },
            Some(Repeat::Rate(period, unit)) => TimingMode::FixedRate {
                period,
                unit,
                initial_delay,
            },
            Some(Repeat::Spaced(spaced_delay, unit)) => TimingMode::FixedDelay {
                spaced_delay,
                unit,
                initial_delay,
            },
            Some(Repeat::Calendar) => {
                if settings.delay.is_some() {
                    warn!(task = %self.inner.name, "Calendar tasks ignore the initial delay");
                }
                TimingMode::Calendar
            }
        };
        mode.validate()?;

        Ok(TaskPlan {
            mode,
            constraints: settings.constraints.clone(),
            timezone: settings.timezone,
            evaluator: TimeWindowEvaluator::new(self.inner.max_search_iterations),
        })
    }

    fn first_run(&self, plan: &TaskPlan, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if plan.mode == TimingMode::Calendar {
            return plan.next_after(self, now, true);
        }
        let delay = chrono::Duration::from_std(plan.mode.initial_delay()).map_err(|_| {
            SchedulerError::Configuration(format!("delay of task ({}) is too large", self.inner.name))
        })?;
        let mut first = now + delay;
        if let Some(start) = plan.constraints.start_on {
            let start = localize(&plan.timezone, start).with_timezone(&Utc);
            first = first.max(start);
        }
        Ok(first)
    }

    /// Validate the configuration and submit the scheduling loop to `pool`.
    ///
    /// Returns immediately with a handle to the loop. Starting a task whose
    /// loop is still live returns the existing handle.
    pub fn start(&self, pool: &Arc<dyn WorkerPool>) -> Result<TaskHandle> {
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        let settings = self.inner.settings.read().clone();
        if settings.disabled {
            return Err(SchedulerError::Disabled(self.inner.name.clone()));
        }
        if let Some(message) = settings.pending_error.as_ref() {
            return Err(SchedulerError::Configuration(format!(
                "task ({}): {message}",
                self.inner.name
            )));
        }
        if settings.target.is_none() {
            return Err(SchedulerError::Configuration(format!(
                "task ({}) has no target to call",
                self.inner.name
            )));
        }

        // The gate may run during the search, so no lock is held here.
        let plan = self.plan(&settings)?;
        let first = self.first_run(&plan, self.inner.clock.now())?;
        let kind = plan.mode.kind();

        let mut current = self.inner.current.lock();
        if let Some(handle) = current.as_ref().filter(|handle| handle.is_live()) {
            return Ok(handle.clone());
        }

        // The loop owns next_run from here on.
        self.set_next_run(Some(first));
        let cancel = pool.terminated().child_token();
        let work = execution::run_loop(self.clone(), plan, pool.clone(), cancel.clone(), first);
        let join = match pool.submit(Box::pin(work)) {
            Ok(join) => join,
            Err(e) => {
                self.set_next_run(None);
                return Err(e);
            }
        };
        let handle = TaskHandle::new(self.inner.name.clone(), cancel, join);

        *current = Some(handle.clone());
        self.inner.started.store(true, Ordering::SeqCst);

        info!(
            task = %self.inner.name,
            mode = kind,
            next_run = %first,
            "Task scheduled"
        );
        Ok(handle)
    }

    /// Fire once on the calling thread, outside of any schedule.
    ///
    /// With `force`, the disabled flag, the constraints and the gate are
    /// ignored. Hooks and stats behave exactly as for a scheduled firing.
    pub fn run(&self, force: bool) -> Result<FireOutcome> {
        if !self.has_target() {
            return Err(SchedulerError::Configuration(format!(
                "task ({}) has no target to call",
                self.inner.name
            )));
        }
        Ok(self.fire(&CancellationToken::new(), force))
    }

    /// Current gate. The settings lock is released before the caller runs it.
    pub(crate) fn gate(&self) -> Option<Gate> {
        self.inner.settings.read().gate.clone()
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn set_next_run(&self, next: Option<DateTime<Utc>>) {
        self.inner.stats.write().next_run = next;
    }

    /// One firing: gate, hooks, target, stats. Never panics or returns an error.
    pub(crate) fn fire(&self, cancel: &CancellationToken, force: bool) -> FireOutcome {
        let settings = self.inner.settings.read().clone();
        let name = self.inner.name.as_str();

        if !force {
            if settings.disabled {
                debug!(task = %name, "Task disabled, skipping firing");
                return FireOutcome::Skipped;
            }
            let now = self.inner.clock.now().with_timezone(&settings.timezone);
            let evaluator = TimeWindowEvaluator::new(self.inner.max_search_iterations);
            if !evaluator.is_eligible_now(&settings.constraints, now, || {
                self.check_gate(settings.gate.as_ref())
            }) {
                debug!(task = %name, "Task not eligible, skipping firing");
                return FireOutcome::Skipped;
            }
        }

        let Some(target) = settings.target.clone() else {
            warn!(task = %name, "Task has no target, skipping firing");
            return FireOutcome::Skipped;
        };

        let fired_at = self.inner.clock.now();
        let run_number = self.inner.stats.read().total_runs + 1;
        let ctx = TaskContext::new(name, self.inner.group.as_str(), fired_at, run_number, cancel.clone());
        if settings.debug {
            debug!(
                task = %name,
                execution_id = %ctx.execution_id,
                run = run_number,
                method = %settings.method,
                "Firing task"
            );
        }

        if let Some(hook) = &settings.before {
            self.guard("before", || hook(self));
        }
        self.guard("before_any_task", || self.inner.lifecycle.before_any_task(self));

        let started = Instant::now();
        let result = match catch_unwind(AssertUnwindSafe(|| target.invoke(&settings.method, &ctx))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(SchedulerError::Execution {
                task: name.to_string(),
                source,
            }),
            Err(payload) => Err(SchedulerError::Execution {
                task: name.to_string(),
                source: anyhow::anyhow!("task panicked: {}", panic_message(payload.as_ref())),
            }),
        };
        self.record_run(fired_at, started, &result);

        let outcome = match &result {
            Ok(value) => {
                if let Some(hook) = &settings.on_success {
                    self.guard("on_success", || hook(self, value.as_ref()));
                }
                self.guard("on_any_task_success", || {
                    self.inner.lifecycle.on_any_task_success(self, value.as_ref())
                });
                FireOutcome::Succeeded
            }
            Err(err) => {
                if let Some(hook) = &settings.on_failure {
                    self.guard("on_failure", || hook(self, err));
                }
                self.guard("on_any_task_error", || self.inner.lifecycle.on_any_task_error(self, err));
                FireOutcome::Failed
            }
        };

        let value = result.as_ref().ok().and_then(Option::as_ref);
        if let Some(hook) = &settings.after {
            self.guard("after", || hook(self, value));
        }
        self.guard("after_any_task", || self.inner.lifecycle.after_any_task(self, value));

        outcome
    }

    fn record_run(&self, fired_at: DateTime<Utc>, started: Instant, result: &Result<Option<Value>>) {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut stats = self.inner.stats.write();
        stats.last_run = Some(fired_at);
        stats.total_runs += 1;
        stats.last_execution_time = elapsed_ms;
        stats.never_run = false;
        match result {
            Ok(value) => {
                stats.total_success += 1;
                stats.last_result = value.clone();
            }
            Err(err) => {
                stats.total_failures += 1;
                stats.last_error = Some(err.chain());
            }
        }
    }

    pub(crate) fn check_gate(&self, gate: Option<&Gate>) -> bool {
        let Some(gate) = gate else {
            return true;
        };
        match catch_unwind(AssertUnwindSafe(|| gate(self))) {
            Ok(open) => open,
            Err(payload) => {
                error!(
                    task = %self.inner.name,
                    panic = %panic_message(payload.as_ref()),
                    "Gate panicked, skipping firing"
                );
                false
            }
        }
    }

    /// Run a user hook. A panicking hook is logged and does not stop the firing.
    fn guard(&self, hook: &str, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            error!(
                task = %self.inner.name,
                hook,
                panic = %panic_message(payload.as_ref()),
                "Hook panicked"
            );
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.inner.name)
            .field("group", &self.inner.group)
            .field("scheduler", &self.inner.scheduler)
            .field("started", &self.is_started())
            .finish()
    }
}

fn parse_date_time(date: &str, time: &str) -> std::result::Result<NaiveDateTime, String> {
    let date = parse_date(date).map_err(|e| e.to_string())?;
    let time = parse_time(time).map_err(|e| e.to_string())?;
    Ok(date.and_time(time))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TokioPool;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug)]
    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn task_at(name: &str, now: DateTime<Utc>) -> ScheduledTask {
        ScheduledTask::attached(
            name.to_string(),
            String::new(),
            None,
            Tz::UTC,
            Arc::new(FixedClock(now)),
            Arc::new(DefaultLifecycle),
            DEFAULT_MAX_ITERATIONS,
        )
    }

    fn pool() -> Arc<dyn WorkerPool> {
        Arc::new(TokioPool::new("test-scheduler", tokio::runtime::Handle::current()))
    }

    #[test]
    fn test_default_timing_is_immediate_one_shot() {
        let task = ScheduledTask::new("once").call(|_ctx| Ok(None));
        assert_eq!(
            task.timing_mode().unwrap(),
            TimingMode::OneShotDelay {
                delay: 0,
                unit: TimeUnit::Milliseconds
            }
        );

        let delayed = ScheduledTask::new("later").delay(5, TimeUnit::Seconds);
        assert_eq!(
            delayed.timing_mode().unwrap(),
            TimingMode::OneShotDelay {
                delay: 5,
                unit: TimeUnit::Seconds
            }
        );
    }

    #[test]
    fn test_delay_with_recurring_mode_is_initial_delay() {
        let task = ScheduledTask::new("poll")
            .delay(2, TimeUnit::Seconds)
            .every(10, TimeUnit::Seconds);
        assert_eq!(
            task.timing_mode().unwrap(),
            TimingMode::FixedRate {
                period: 10,
                unit: TimeUnit::Seconds,
                initial_delay: Duration::from_secs(2)
            }
        );

        let kept = ScheduledTask::new("poll")
            .delay(2, TimeUnit::Seconds)
            .delay_with(9, TimeUnit::Seconds, false);
        assert_eq!(kept.timing_mode().unwrap().initial_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_no_overlaps_turns_rate_into_delay() {
        let task = ScheduledTask::new("sync")
            .every(30, TimeUnit::Seconds)
            .with_no_overlaps();
        assert!(matches!(
            task.timing_mode().unwrap(),
            TimingMode::FixedDelay { spaced_delay: 30, .. }
        ));
    }

    #[tokio::test]
    async fn test_conflicting_modes_fail_at_start() {
        let task = ScheduledTask::new("confused")
            .call(|_ctx| Ok(None))
            .every(5, TimeUnit::Seconds)
            .on_mondays("09:00");

        let err = task.start(&pool()).unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert!(err.to_string().contains("conflicting timing modes"));
        assert!(!task.is_started());
    }

    #[tokio::test]
    async fn test_start_requires_target_and_enabled() {
        let pool = pool();
        let err = ScheduledTask::new("empty").start(&pool).unwrap_err();
        assert!(err.is_configuration());

        let err = ScheduledTask::new("off")
            .call(|_ctx| Ok(None))
            .disable()
            .start(&pool)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Disabled(_)));
    }

    #[test]
    fn test_invalid_time_is_reported() {
        let task = ScheduledTask::new("typo")
            .call(|_ctx| Ok(None))
            .every_day_at("25:00");
        let settings = task.inner.settings.read().clone();
        assert!(settings
            .pending_error
            .as_deref()
            .unwrap_or_default()
            .contains("25:00"));
    }

    #[test]
    fn test_run_updates_stats() {
        let task = ScheduledTask::new("counter").call(|ctx| Ok(Some(json!({ "run": ctx.run_number }))));

        assert_eq!(task.run(false).unwrap(), FireOutcome::Succeeded);
        assert_eq!(task.run(false).unwrap(), FireOutcome::Succeeded);

        let stats = task.stats();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.total_success, 2);
        assert_eq!(stats.total_failures, 0);
        assert!(!stats.never_run);
        assert_eq!(stats.last_result, Some(json!({ "run": 2 })));
        assert!(stats.last_run.is_some());
    }

    #[test]
    fn test_hook_order_on_success_and_failure() {
        let calls = Arc::new(Mutex::new(Vec::<String>::new()));
        let record = |label: &'static str| {
            let calls = calls.clone();
            move || calls.lock().push(label.to_string())
        };

        let (before, after, success, failure) = (
            record("before"),
            record("after"),
            record("success"),
            record("failure"),
        );
        let fail = Arc::new(AtomicBool::new(false));
        let should_fail = fail.clone();
        let task = ScheduledTask::new("hooks")
            .call(move |_ctx| {
                if should_fail.load(Ordering::SeqCst) {
                    anyhow::bail!("boom");
                }
                Ok(None)
            })
            .before(move |_| before())
            .after(move |_, _| after())
            .on_success(move |_, _| success())
            .on_failure(move |_, _| failure());

        task.run(false).unwrap();
        assert_eq!(*calls.lock(), vec!["before", "success", "after"]);

        calls.lock().clear();
        fail.store(true, Ordering::SeqCst);
        assert_eq!(task.run(false).unwrap(), FireOutcome::Failed);
        assert_eq!(*calls.lock(), vec!["before", "failure", "after"]);

        let stats = task.stats();
        assert_eq!(stats.total_failures, 1);
        assert!(stats.last_error.unwrap_or_default().contains("boom"));
    }

    #[test]
    fn test_failure_keeps_last_result() {
        let fail = Arc::new(AtomicBool::new(false));
        let should_fail = fail.clone();
        let task = ScheduledTask::new("export").call(move |ctx| {
            if should_fail.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            Ok(Some(json!({ "run": ctx.run_number })))
        });

        assert_eq!(task.run(false).unwrap(), FireOutcome::Succeeded);
        fail.store(true, Ordering::SeqCst);
        assert_eq!(task.run(false).unwrap(), FireOutcome::Failed);

        let stats = task.stats();
        assert_eq!(stats.last_result, Some(json!({ "run": 1 })));
        assert!(stats.last_error.unwrap_or_default().contains("disk full"));
    }

    #[test]
    fn test_panicking_target_is_a_failure() {
        let task = ScheduledTask::new("panics").call(|_ctx| panic!("kaboom"));
        assert_eq!(task.run(false).unwrap(), FireOutcome::Failed);

        let stats = task.stats();
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.total_failures, 1);
        assert!(stats.last_error.unwrap_or_default().contains("kaboom"));
    }

    #[test]
    fn test_gate_and_disabled_skip_unless_forced() {
        let task = ScheduledTask::new("gated")
            .call(|_ctx| Ok(None))
            .when(|_| false);
        assert_eq!(task.run(false).unwrap(), FireOutcome::Skipped);
        assert!(task.stats().never_run);
        assert_eq!(task.run(true).unwrap(), FireOutcome::Succeeded);

        let disabled = ScheduledTask::new("off").call(|_ctx| Ok(None)).disable();
        assert_eq!(disabled.run(false).unwrap(), FireOutcome::Skipped);
        assert_eq!(disabled.run(true).unwrap(), FireOutcome::Succeeded);
    }

    #[test]
    fn test_constraints_checked_at_firing() {
        // Saturday noon.
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let task = task_at("weekday-job", now).call(|_ctx| Ok(None)).on_weekdays("12:00");
        assert_eq!(task.run(false).unwrap(), FireOutcome::Skipped);
    }

    #[test]
    fn test_every_hour_at_computes_initial_delay() {
        let now = Utc.with_ymd_and_hms(2024, 6, 4, 10, 20, 0).unwrap();
        let task = task_at("hourly", now).call(|_ctx| Ok(None)).every_hour_at(45);
        let mode = task.timing_mode().unwrap();
        assert_eq!(mode.initial_delay(), Duration::from_secs(25 * 60));
        assert_eq!(mode.interval(), Some(Duration::from_secs(3600)));

        let wrapped = task_at("hourly", now).call(|_ctx| Ok(None)).every_hour_at(5);
        assert_eq!(
            wrapped.timing_mode().unwrap().initial_delay(),
            Duration::from_secs(45 * 60)
        );
    }

    #[test]
    fn test_meta_keys() {
        let task = ScheduledTask::new("tagged")
            .set_meta_key("owner", "ops")
            .set_meta_key("retries", 3)
            .delete_meta_key("retries");
        assert_eq!(task.meta_value("owner"), Some(json!("ops")));
        assert!(task.meta_value("retries").is_none());
        assert_eq!(task.meta().len(), 1);
    }

    #[tokio::test]
    async fn test_calendar_first_run_uses_evaluator() {
        // Tuesday 18:00, after the window has closed.
        let now = Utc.with_ymd_and_hms(2024, 6, 4, 18, 0, 0).unwrap();
        let task = task_at("business-hours", now)
            .call(|_ctx| Ok(None))
            .on_weekdays("09:00")
            .between("09:00", "17:00");

        let pool = pool();
        let handle = task.start(&pool).unwrap();
        assert_eq!(
            task.stats().next_run,
            Some(Utc.with_ymd_and_hms(2024, 6, 5, 9, 0, 0).unwrap())
        );

        // A second start keeps the live loop.
        let again = task.start(&pool).unwrap();
        assert!(again.same_as(&handle));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_closed_gate_exhausts_calendar_start() {
        let now = Utc.with_ymd_and_hms(2024, 6, 4, 8, 0, 0).unwrap();
        let task = task_at("never", now)
            .call(|_ctx| Ok(None))
            .every_day_at("09:00")
            .when(|_| false);

        let err = task.start(&pool()).unwrap_err();
        assert!(matches!(err, SchedulerError::SearchExhausted { ref task, .. } if task == "never"));
        assert!(!task.is_started());
        assert!(task.stats().next_run.is_none());
    }

    #[tokio::test]
    async fn test_gate_runs_without_task_locks_held() {
        let now = Utc.with_ymd_and_hms(2024, 6, 4, 8, 0, 0).unwrap();
        let task = task_at("introspective", now)
            .call(|_ctx| Ok(None))
            .every_day_at("09:00")
            .when(|task| task.handle().is_none() && task.stats().never_run);

        let handle = task.start(&pool()).unwrap();
        assert_eq!(
            task.stats().next_run,
            Some(Utc.with_ymd_and_hms(2024, 6, 4, 9, 0, 0).unwrap())
        );
        handle.cancel();
    }
}
