//! Worker pools and the provider that hands them out.
//!
//! The scheduler never spawns work on its own. It asks a [`PoolProvider`] for
//! a named [`WorkerPool`] at startup and gives it back at shutdown. The
//! default provider builds pools on the current tokio runtime, tracking every
//! spawned future and blocking closure with a `TaskTracker` so shutdown can
//! wait for them to drain.

use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Boxed future accepted by [`WorkerPool::submit`].
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Blocking closure accepted by [`WorkerPool::submit_blocking`].
pub type BlockingWork = Box<dyn FnOnce() + Send + 'static>;

/// A named pool that runs scheduling loops and firings.
#[async_trait]
pub trait WorkerPool: Send + Sync + fmt::Debug {
    /// Pool name.
    fn name(&self) -> &str;

    /// Run an async scheduling loop. Fails once the pool is shutting down.
    fn submit(&self, work: BoxFuture) -> Result<JoinHandle<()>>;

    /// Run a firing on a blocking thread. Fails once the pool is shutting down.
    fn submit_blocking(&self, work: BlockingWork) -> Result<JoinHandle<()>>;

    /// Cancelled when shutdown starts. Loops stop rescheduling.
    fn closing(&self) -> CancellationToken;

    /// Cancelled on forced shutdown. In-flight firings see it as cancellation.
    fn terminated(&self) -> CancellationToken;

    /// Stop accepting work and wait up to `timeout` for submitted work to finish.
    ///
    /// Returns `false` if work was still running when the timeout elapsed.
    async fn shutdown_and_await_termination(&self, timeout: Duration) -> bool;

    /// Stop accepting work and cancel everything in flight.
    fn shutdown_now(&self);

    /// Check if shutdown has started.
    fn is_shutdown(&self) -> bool;
}

/// Creates and releases named pools.
pub trait PoolProvider: Send + Sync + fmt::Debug {
    /// Create a pool named `name`, replacing any earlier pool with that name.
    fn new_named_pool(&self, name: &str) -> Result<Arc<dyn WorkerPool>>;

    /// Release the pool named `name`. Unknown names are ignored.
    fn delete_pool(&self, name: &str);
}

/// Pool backed by a tokio runtime.
pub struct TokioPool {
    name: String,
    runtime: Handle,
    tracker: TaskTracker,
    closing: CancellationToken,
    terminated: CancellationToken,
}

impl TokioPool {
    /// Create a pool that spawns onto `runtime`.
    pub fn new(name: impl Into<String>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            runtime,
            tracker: TaskTracker::new(),
            closing: CancellationToken::new(),
            terminated: CancellationToken::new(),
        }
    }

    /// Futures and blocking closures still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(SchedulerError::Pool(format!(
                "pool ({}) is shut down and rejects new work",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerPool for TokioPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, work: BoxFuture) -> Result<JoinHandle<()>> {
        self.ensure_open()?;
        Ok(self.tracker.spawn_on(work, &self.runtime))
    }

    fn submit_blocking(&self, work: BlockingWork) -> Result<JoinHandle<()>> {
        self.ensure_open()?;
        Ok(self.tracker.spawn_blocking_on(work, &self.runtime))
    }

    fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    async fn shutdown_and_await_termination(&self, timeout: Duration) -> bool {
        self.closing.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                debug!(pool = %self.name, "Pool drained");
                true
            }
            Err(_) => {
                warn!(
                    pool = %self.name,
                    active = self.tracker.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Pool did not drain before the timeout"
                );
                false
            }
        }
    }

    fn shutdown_now(&self) {
        self.closing.cancel();
        self.terminated.cancel();
        self.tracker.close();
        debug!(pool = %self.name, active = self.tracker.len(), "Pool terminated");
    }

    fn is_shutdown(&self) -> bool {
        self.closing.is_cancelled()
    }
}

impl fmt::Debug for TokioPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioPool")
            .field("name", &self.name)
            .field("active", &self.tracker.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Provider that builds [`TokioPool`]s on one runtime.
#[derive(Debug)]
pub struct TokioPoolProvider {
    runtime: Handle,
    pools: Mutex<HashMap<String, Arc<TokioPool>>>,
}

impl TokioPoolProvider {
    /// Create a provider for `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Create a provider for the runtime this is called from.
    pub fn current() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            SchedulerError::Pool(format!("no tokio runtime available: {e}"))
        })?;
        Ok(Self::new(runtime))
    }

    /// Names of the pools currently handed out, sorted.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl PoolProvider for TokioPoolProvider {
    fn new_named_pool(&self, name: &str) -> Result<Arc<dyn WorkerPool>> {
        let pool = Arc::new(TokioPool::new(name, self.runtime.clone()));
        let previous = self.pools.lock().insert(name.to_string(), pool.clone());
        if let Some(previous) = previous {
            warn!(pool = %name, "Replacing a pool that was never deleted");
            previous.shutdown_now();
        }
        info!(pool = %name, "Created worker pool");
        Ok(pool)
    }

    fn delete_pool(&self, name: &str) {
        if let Some(pool) = self.pools.lock().remove(name) {
            pool.shutdown_now();
            info!(pool = %name, "Deleted worker pool");
        }
    }
}
