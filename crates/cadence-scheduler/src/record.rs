//! Task records, run statistics and the ordered registry that holds them.

use crate::error::SchedulerError;
use crate::handle::TaskHandle;
use crate::task::ScheduledTask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run statistics of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub name: String,
    pub group: String,
    pub created: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub total_failures: u64,
    pub total_success: u64,
    /// Duration of the most recent firing, in milliseconds.
    pub last_execution_time: u64,
    /// Value returned by the most recent successful firing.
    pub last_result: Option<Value>,
    /// Error chain of the most recent failed firing.
    pub last_error: Option<String>,
    pub never_run: bool,
}

impl TaskStats {
    pub(crate) fn new(name: &str, group: &str, created: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            created,
            last_run: None,
            next_run: None,
            total_runs: 0,
            total_failures: 0,
            total_success: 0,
            last_execution_time: 0,
            last_result: None,
            last_error: None,
            never_run: true,
        }
    }
}

/// Binding between a registered task and its live handle.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub name: String,
    pub group: String,
    pub task: ScheduledTask,
    /// Set once the task is started; cleared by removal or shutdown.
    pub future: Option<TaskHandle>,
    pub registered_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub disabled: bool,
    /// Set if starting the task failed.
    pub error: bool,
    pub error_message: Option<String>,
    /// Full error chain of the start failure.
    pub error_detail: Option<String>,
}

impl TaskRecord {
    pub(crate) fn new(task: ScheduledTask, registered_at: DateTime<Utc>) -> Self {
        Self {
            name: task.name().to_string(),
            group: task.group().to_string(),
            task,
            future: None,
            registered_at,
            scheduled_at: None,
            disabled: false,
            error: false,
            error_message: None,
            error_detail: None,
        }
    }

    /// Check if the record has a handle that is neither cancelled nor finished.
    pub fn is_live(&self) -> bool {
        self.future.as_ref().is_some_and(TaskHandle::is_live)
    }

    /// Snapshot of the task's stats.
    pub fn stats(&self) -> TaskStats {
        self.task.stats()
    }

    pub(crate) fn mark_scheduled(&mut self, handle: TaskHandle, at: DateTime<Utc>) {
        self.future = Some(handle);
        self.scheduled_at = Some(at);
        self.disabled = false;
        self.error = false;
        self.error_message = None;
        self.error_detail = None;
    }

    pub(crate) fn mark_disabled(&mut self) {
        self.disabled = true;
    }

    pub(crate) fn mark_failed(&mut self, err: &SchedulerError) {
        self.error = true;
        self.error_message = Some(err.to_string());
        self.error_detail = Some(err.chain());
    }

    /// Cancel and drop the handle, if any. Returns true if one was live.
    pub(crate) fn cancel(&mut self) -> bool {
        match self.future.take() {
            Some(handle) => {
                let live = handle.is_live();
                handle.cancel();
                live
            }
            None => false,
        }
    }
}

/// Registry of task records in registration order.
#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
    records: Vec<TaskRecord>,
}

impl TaskRegistry {
    /// Insert a record, replacing a record with the same name in place.
    pub(crate) fn insert(&mut self, record: TaskRecord) -> Option<TaskRecord> {
        match self.records.iter_mut().find(|r| r.name == record.name) {
            Some(slot) => Some(std::mem::replace(slot, record)),
            None => {
                self.records.push(record);
                None
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&TaskRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut TaskRecord> {
        self.records.iter_mut().find(|r| r.name == name)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<TaskRecord> {
        let index = self.records.iter().position(|r| r.name == name)?;
        Some(self.records.remove(index))
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub(crate) fn clear(&mut self) -> Vec<TaskRecord> {
        std::mem::take(&mut self.records)
    }

    /// Names in lexical order.
    pub(crate) fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut TaskRecord> {
        self.records.iter_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
