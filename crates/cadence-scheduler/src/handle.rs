//! Cancelable handle to a started task.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to the scheduling loop of one started task.
///
/// Clones share the same loop. Cancelling stops future firings and flags the
/// token seen by an in-flight firing through its `TaskContext`.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    task: String,
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub(crate) fn new(task: impl Into<String>, cancel: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                task: task.into(),
                cancel,
                join: Mutex::new(Some(join)),
            }),
        }
    }

    /// Name of the task this handle drives.
    pub fn task_name(&self) -> &str {
        &self.inner.task
    }

    /// Stop the loop and signal cancellation to an in-flight firing.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        if let Some(join) = self.inner.join.lock().as_ref() {
            join.abort();
        }
    }

    /// Check if [`cancel`](Self::cancel) was called, directly or through shutdown.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Check if the loop has exited. One-shot tasks finish after their firing.
    pub fn is_finished(&self) -> bool {
        self.inner
            .join
            .lock()
            .as_ref()
            .map(|join| join.is_finished())
            .unwrap_or(true)
    }

    /// Neither cancelled nor finished.
    pub fn is_live(&self) -> bool {
        !self.is_cancelled() && !self.is_finished()
    }

    /// Wait for the loop to exit. Returns false if the loop panicked.
    pub async fn wait(&self) -> bool {
        let join = self.inner.join.lock().take();
        let Some(join) = join else {
            return true;
        };
        match join.await {
            Ok(()) => true,
            Err(e) if e.is_panic() => {
                warn!(task = %self.inner.task, error = %e, "Scheduling loop panicked");
                false
            }
            Err(e) => {
                debug!(task = %self.inner.task, error = %e, "Scheduling loop aborted");
                true
            }
        }
    }

    /// Check if both handles drive the same loop.
    pub fn same_as(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.inner.task)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}
