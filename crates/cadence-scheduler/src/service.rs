//! Registry of named schedulers.

use crate::error::{Result, SchedulerError};
use crate::record::TaskStats;
use crate::scheduler::Scheduler;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info};

/// Process-wide registry of schedulers, keyed by scheduler name.
///
/// The registry lock is never held across an `await`; operations copy the
/// scheduler handle out first.
#[derive(Debug, Default)]
pub struct SchedulerService {
    schedulers: RwLock<BTreeMap<String, Scheduler>>,
}

impl SchedulerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scheduler under its name.
    ///
    /// Fails if the name is taken, unless `force` is set. With `force`, the
    /// scheduler previously registered under that name is shut down.
    pub async fn register_scheduler(&self, scheduler: Scheduler, force: bool) -> Result<Scheduler> {
        let name = scheduler.name().to_string();
        let replaced = {
            let mut schedulers = self.schedulers.write();
            if schedulers.contains_key(&name) && !force {
                return Err(SchedulerError::SchedulerExists(name));
            }
            schedulers.insert(name.clone(), scheduler.clone())
        };

        if let Some(old) = replaced.filter(|old| !old.same_as(&scheduler)) {
            info!(scheduler = %name, "Replacing registered scheduler");
            old.shutdown_now().await;
        }
        info!(scheduler = %name, "Scheduler registered");
        Ok(scheduler)
    }

    /// Register and start a scheduler.
    pub async fn register_and_start(&self, scheduler: Scheduler, force: bool) -> Result<Scheduler> {
        let scheduler = self.register_scheduler(scheduler, force).await?;
        scheduler.startup().await?;
        Ok(scheduler)
    }

    /// Run the scheduler's `configure` step and register it, replacing any
    /// scheduler with the same name.
    pub async fn load_scheduler(&self, scheduler: Scheduler) -> Result<Scheduler> {
        scheduler.configure();
        self.register_scheduler(scheduler, true).await
    }

    /// Start a registered scheduler unless it is already running.
    pub async fn startup_scheduler(&self, name: &str) -> Result<Scheduler> {
        let scheduler = self.get_scheduler_or_fail(name)?;
        if !scheduler.has_started() {
            scheduler.startup().await?;
        }
        Ok(scheduler)
    }

    /// Start every registered scheduler that is not running. Failures are logged.
    pub async fn startup_all(&self) -> &Self {
        for scheduler in self.snapshot() {
            if scheduler.has_started() {
                continue;
            }
            if let Err(e) = scheduler.startup().await {
                error!(scheduler = %scheduler.name(), error = %e, "Scheduler failed to start");
            }
        }
        self
    }

    pub async fn shutdown_scheduler(&self, name: &str, force: bool, timeout: Duration) -> Result<Scheduler> {
        let scheduler = self.get_scheduler_or_fail(name)?;
        scheduler.shutdown_with(force, timeout).await;
        Ok(scheduler)
    }

    /// Shut down every registered scheduler with its configured timeout.
    pub async fn shutdown_all(&self, force: bool) -> &Self {
        for scheduler in self.snapshot() {
            let timeout = scheduler.config().shutdown_timeout();
            scheduler.shutdown_with(force, timeout).await;
        }
        self
    }

    pub async fn restart_scheduler(&self, name: &str, force: bool, timeout: Duration) -> Result<Scheduler> {
        let scheduler = self.get_scheduler_or_fail(name)?;
        scheduler.restart(force, timeout).await?;
        Ok(scheduler)
    }

    /// Shut down and unregister a scheduler. Returns false if it was not registered.
    pub async fn remove_scheduler(&self, name: &str, force: bool, timeout: Duration) -> bool {
        let removed = self.schedulers.write().remove(name);
        match removed {
            Some(scheduler) => {
                scheduler.shutdown_with(force, timeout).await;
                info!(scheduler = %name, "Scheduler removed");
                true
            }
            None => false,
        }
    }

    /// Shut down and unregister every scheduler.
    pub async fn clear_schedulers(&self, force: bool, timeout: Duration) -> &Self {
        let drained = std::mem::take(&mut *self.schedulers.write());
        for scheduler in drained.into_values() {
            scheduler.shutdown_with(force, timeout).await;
        }
        self
    }

    pub fn get_scheduler(&self, name: &str) -> Option<Scheduler> {
        self.schedulers.read().get(name).cloned()
    }

    /// Look up a scheduler; the error lists every registered name.
    pub fn get_scheduler_or_fail(&self, name: &str) -> Result<Scheduler> {
        let schedulers = self.schedulers.read();
        schedulers
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::SchedulerNotFound {
                name: name.to_string(),
                registered: schedulers.keys().cloned().collect(),
            })
    }

    /// Registered names, sorted.
    pub fn scheduler_names(&self) -> Vec<String> {
        self.schedulers.read().keys().cloned().collect()
    }

    pub fn has_scheduler(&self, name: &str) -> bool {
        self.schedulers.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.schedulers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.read().is_empty()
    }

    /// Task stats of one scheduler.
    pub fn scheduler_stats(&self, name: &str) -> Result<BTreeMap<String, TaskStats>> {
        Ok(self.get_scheduler_or_fail(name)?.task_stats())
    }

    /// Task stats of every scheduler, keyed by scheduler name.
    pub fn all_stats(&self) -> BTreeMap<String, BTreeMap<String, TaskStats>> {
        self.snapshot()
            .into_iter()
            .map(|scheduler| (scheduler.name().to_string(), scheduler.task_stats()))
            .collect()
    }

    fn snapshot(&self) -> Vec<Scheduler> {
        self.schedulers.read().values().cloned().collect()
    }
}
