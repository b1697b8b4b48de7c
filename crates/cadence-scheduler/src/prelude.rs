//! Convenience re-exports for common types.

pub use crate::config::SchedulerConfig;
pub use crate::delegate::{DelegateTarget, Hook, HookSet, SchedulerDelegate};
pub use crate::error::{Result, SchedulerError};
pub use crate::handle::TaskHandle;
pub use crate::invocable::{Invocable, MethodTable, TaskContext, TaskResult};
pub use crate::lifecycle::{ConfigureFn, SchedulerLifecycle};
pub use crate::record::{TaskRecord, TaskStats};
pub use crate::schedule::{Constraints, TimingMode};
pub use crate::scheduler::{Scheduler, SchedulerBuilder};
pub use crate::service::SchedulerService;
pub use crate::task::{FireOutcome, ScheduledTask};
pub use crate::time::TimeUnit;
