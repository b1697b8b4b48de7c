//! Scheduling loops.
//!
//! Each started task runs one loop on its scheduler's worker pool. The loop
//! sleeps until the next firing, hands the firing to a blocking worker and
//! works out when to fire again. Loops stop when the task is cancelled, when
//! the pool starts shutting down, or when the task has nothing left to do.

use crate::error::Result;
use crate::pool::WorkerPool;
use crate::schedule::TimingMode;
use crate::task::{ScheduledTask, TaskPlan};
use crate::time::until;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Drive `task` according to `plan`, starting at `first`.
pub(crate) async fn run_loop(
    task: ScheduledTask,
    plan: TaskPlan,
    pool: Arc<dyn WorkerPool>,
    cancel: CancellationToken,
    first: DateTime<Utc>,
) {
    let runner = Runner {
        closing: pool.closing(),
        task,
        plan,
        pool,
        cancel,
    };

    let finished = match runner.plan.mode {
        TimingMode::OneShotDelay { .. } => runner.one_shot(first).await,
        TimingMode::FixedRate { period, unit, .. } => {
            runner.fixed_rate(first, unit.to_duration(period)).await
        }
        TimingMode::FixedDelay {
            spaced_delay, unit, ..
        } => runner.fixed_delay(first, unit.to_duration(spaced_delay)).await,
        TimingMode::Calendar => runner.calendar(first).await,
    };

    if finished {
        runner.task.set_next_run(None);
        debug!(task = %runner.task.name(), "Task has no further runs");
    } else {
        debug!(task = %runner.task.name(), "Scheduling loop stopped");
    }
}

struct Runner {
    task: ScheduledTask,
    plan: TaskPlan,
    pool: Arc<dyn WorkerPool>,
    cancel: CancellationToken,
    closing: CancellationToken,
}

// Each loop returns true when the task ran out of firings on its own, and
// false when it was stopped from outside.
impl Runner {
    async fn one_shot(&self, at: DateTime<Utc>) -> bool {
        if !self.sleep_until(at).await {
            return false;
        }
        if let Some(join) = self.dispatch() {
            self.complete(join).await;
        }
        true
    }

    /// Next firing scheduled relative to the previous start. Firings may overlap.
    async fn fixed_rate(&self, first: DateTime<Utc>, period: Duration) -> bool {
        let start = Instant::now() + until(self.now(), first);
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => return false,
                _ = self.closing.cancelled() => return false,
            }
            if self.ended() {
                return true;
            }
            if self.dispatch().is_none() {
                return false;
            }
            self.task.set_next_run(Some(add(self.now(), period)));
        }
    }

    /// Next firing scheduled relative to the previous completion.
    async fn fixed_delay(&self, first: DateTime<Utc>, spacing: Duration) -> bool {
        let mut next = first;
        loop {
            if !self.sleep_until(next).await {
                return false;
            }
            if self.ended() {
                return true;
            }
            let Some(join) = self.dispatch() else {
                return false;
            };
            if !self.complete(join).await || self.stopped() {
                return false;
            }
            next = add(self.now(), spacing);
            self.task.set_next_run(Some(next));
        }
    }

    async fn calendar(&self, first: DateTime<Utc>) -> bool {
        let mut next = first;
        loop {
            if !self.sleep_until(next).await {
                return false;
            }
            let Some(join) = self.dispatch() else {
                return false;
            };
            if !self.complete(join).await || self.stopped() {
                return false;
            }
            match self.reschedule(self.now().max(next)) {
                Ok(upcoming) => {
                    next = upcoming;
                    self.task.set_next_run(Some(next));
                }
                Err(e) => {
                    error!(
                        task = %self.task.name(),
                        error = %e,
                        "No further run time, task will not fire again"
                    );
                    return true;
                }
            }
        }
    }

    /// Next calendar slot after `after`.
    ///
    /// A gate that is closed for the whole search skips firings without ending
    /// the task, so the loop keeps the next slot the constraints allow.
    fn reschedule(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self.plan.next_after(&self.task, after, true) {
            Err(e) if self.task.gate().is_some() => {
                debug!(task = %self.task.name(), error = %e, "Gate closed for every candidate");
                self.plan.next_after(&self.task, after, false)
            }
            outcome => outcome,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.task.clock().now()
    }

    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.closing.is_cancelled()
    }

    fn ended(&self) -> bool {
        if self.plan.has_ended(self.now()) {
            info!(task = %self.task.name(), "Validity window has ended, task will not fire again");
            return true;
        }
        false
    }

    /// Sleep until the clock reads `at`. Returns false if the loop should stop instead.
    ///
    /// The sleep itself is monotonic, so a wall clock that stepped back while
    /// sleeping wakes the loop early; it goes back to sleep for the rest.
    async fn sleep_until(&self, at: DateTime<Utc>) -> bool {
        loop {
            let wait = until(self.now(), at);
            if wait.is_zero() {
                return !self.stopped();
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => return false,
                _ = self.closing.cancelled() => return false,
            }
        }
    }

    /// Hand one firing to a blocking worker.
    fn dispatch(&self) -> Option<JoinHandle<()>> {
        let task = self.task.clone();
        let cancel = self.cancel.clone();
        let work = Box::new(move || {
            task.fire(&cancel, false);
        });
        match self.pool.submit_blocking(work) {
            Ok(join) => Some(join),
            Err(e) => {
                debug!(task = %self.task.name(), error = %e, "Pool rejected firing");
                None
            }
        }
    }

    /// Wait for a firing to finish. Returns false if the task was cancelled first.
    ///
    /// Graceful shutdown does not interrupt the wait, so an in-flight firing
    /// completes before the loop exits.
    async fn complete(&self, join: JoinHandle<()>) -> bool {
        tokio::select! {
            result = join => {
                if let Err(e) = result {
                    error!(task = %self.task.name(), error = %e, "Firing did not complete");
                }
                !self.cancel.is_cancelled()
            }
            _ = self.cancel.cancelled() => false,
        }
    }
}

fn add(at: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| at.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
