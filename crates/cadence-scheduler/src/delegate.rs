//! Scheduler whose lifecycle hooks are supplied by a separate target object.
//!
//! The target declares which hooks it overrides through [`DelegateTarget::hooks`].
//! The set is read once, when the delegate is built. Declared hooks are
//! forwarded to the target; every other hook falls back to the default
//! logging behavior. `configure` is always forwarded.

use crate::error::{Result, SchedulerError};
use crate::lifecycle::{DefaultLifecycle, SchedulerLifecycle};
use crate::scheduler::{Scheduler, SchedulerBuilder};
use crate::task::ScheduledTask;
use serde_json::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Lifecycle hooks a target may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    OnStartup,
    OnShutdown,
    OnAnyTaskError,
    OnAnyTaskSuccess,
    BeforeAnyTask,
    AfterAnyTask,
}

impl Hook {
    pub const ALL: [Hook; 6] = [
        Hook::OnStartup,
        Hook::OnShutdown,
        Hook::OnAnyTaskError,
        Hook::OnAnyTaskSuccess,
        Hook::BeforeAnyTask,
        Hook::AfterAnyTask,
    ];

    /// Callback name as exposed by delegation targets.
    pub fn name(self) -> &'static str {
        match self {
            Self::OnStartup => "onStartup",
            Self::OnShutdown => "onShutdown",
            Self::OnAnyTaskError => "onAnyTaskError",
            Self::OnAnyTaskSuccess => "onAnyTaskSuccess",
            Self::BeforeAnyTask => "beforeAnyTask",
            Self::AfterAnyTask => "afterAnyTask",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of hooks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HookSet(u8);

impl HookSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Hook::ALL.into_iter().collect()
    }

    pub fn with(self, hook: Hook) -> Self {
        Self(self.0 | hook.bit())
    }

    pub fn contains(self, hook: Hook) -> bool {
        self.0 & hook.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Hooks in the set, in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Hook> {
        Hook::ALL.into_iter().filter(move |hook| self.contains(*hook))
    }
}

impl FromIterator<Hook> for HookSet {
    fn from_iter<I: IntoIterator<Item = Hook>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), HookSet::with)
    }
}

/// Object that configures a scheduler and optionally overrides its hooks.
///
/// Override a hook by implementing its method and listing it in [`hooks`](Self::hooks).
/// Methods that are not listed are never called.
pub trait DelegateTarget: Send + Sync {
    /// Hooks this target overrides.
    fn hooks(&self) -> HookSet {
        HookSet::empty()
    }

    /// Register tasks on `scheduler`.
    fn configure(&self, scheduler: &Scheduler);

    fn on_startup(&self, _scheduler: &Scheduler) {}

    fn on_shutdown(&self, _scheduler: &Scheduler) {}

    fn on_any_task_error(&self, _task: &ScheduledTask, _err: &SchedulerError) {}

    fn on_any_task_success(&self, _task: &ScheduledTask, _result: Option<&Value>) {}

    fn before_any_task(&self, _task: &ScheduledTask) {}

    fn after_any_task(&self, _task: &ScheduledTask, _result: Option<&Value>) {}
}

/// Lifecycle that dispatches to a [`DelegateTarget`].
pub struct DelegatingLifecycle {
    target: Arc<dyn DelegateTarget>,
    hooks: HookSet,
    fallback: DefaultLifecycle,
}

impl DelegatingLifecycle {
    pub fn new(target: Arc<dyn DelegateTarget>) -> Self {
        let hooks = target.hooks();
        Self {
            target,
            hooks,
            fallback: DefaultLifecycle,
        }
    }

    /// Hooks resolved at construction.
    pub fn hooks(&self) -> HookSet {
        self.hooks
    }
}

impl SchedulerLifecycle for DelegatingLifecycle {
    fn configure(&self, scheduler: &Scheduler) {
        self.target.configure(scheduler)
    }

    fn on_startup(&self, scheduler: &Scheduler) {
        if self.hooks.contains(Hook::OnStartup) {
            self.target.on_startup(scheduler)
        } else {
            self.fallback.on_startup(scheduler)
        }
    }

    fn on_shutdown(&self, scheduler: &Scheduler) {
        if self.hooks.contains(Hook::OnShutdown) {
            self.target.on_shutdown(scheduler)
        } else {
            self.fallback.on_shutdown(scheduler)
        }
    }

    fn on_any_task_error(&self, task: &ScheduledTask, err: &SchedulerError) {
        if self.hooks.contains(Hook::OnAnyTaskError) {
            self.target.on_any_task_error(task, err)
        } else {
            self.fallback.on_any_task_error(task, err)
        }
    }

    fn on_any_task_success(&self, task: &ScheduledTask, result: Option<&Value>) {
        if self.hooks.contains(Hook::OnAnyTaskSuccess) {
            self.target.on_any_task_success(task, result)
        } else {
            self.fallback.on_any_task_success(task, result)
        }
    }

    fn before_any_task(&self, task: &ScheduledTask) {
        if self.hooks.contains(Hook::BeforeAnyTask) {
            self.target.before_any_task(task)
        } else {
            self.fallback.before_any_task(task)
        }
    }

    fn after_any_task(&self, task: &ScheduledTask, result: Option<&Value>) {
        if self.hooks.contains(Hook::AfterAnyTask) {
            self.target.after_any_task(task, result)
        } else {
            self.fallback.after_any_task(task, result)
        }
    }
}

/// A [`Scheduler`] driven by a [`DelegateTarget`].
///
/// Derefs to the wrapped scheduler, so every scheduler operation is
/// available unchanged.
#[derive(Clone)]
pub struct SchedulerDelegate {
    scheduler: Scheduler,
    target: Arc<dyn DelegateTarget>,
    hooks: HookSet,
}

impl SchedulerDelegate {
    /// Build the scheduler from `builder` with `target` as its lifecycle.
    pub fn new(builder: SchedulerBuilder, target: impl DelegateTarget + 'static) -> Result<Self> {
        Self::from_shared(builder, Arc::new(target))
    }

    /// Like [`new`](Self::new), for a target that is shared elsewhere.
    pub fn from_shared(builder: SchedulerBuilder, target: Arc<dyn DelegateTarget>) -> Result<Self> {
        let lifecycle = DelegatingLifecycle::new(target.clone());
        let hooks = lifecycle.hooks();
        let scheduler = builder.with_lifecycle(lifecycle).build()?;
        Ok(Self {
            scheduler,
            target,
            hooks,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn target(&self) -> &Arc<dyn DelegateTarget> {
        &self.target
    }

    /// Check if the target overrides `hook`.
    pub fn overrides(&self, hook: Hook) -> bool {
        self.hooks.contains(hook)
    }

    pub fn into_scheduler(self) -> Scheduler {
        self.scheduler
    }
}

impl Deref for SchedulerDelegate {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl fmt::Debug for SchedulerDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerDelegate")
            .field("scheduler", &self.scheduler)
            .field("overrides", &self.hooks.iter().map(Hook::name).collect::<Vec<_>>())
            .finish()
    }
}
