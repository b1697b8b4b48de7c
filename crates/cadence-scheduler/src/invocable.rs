//! Task targets and the context handed to them.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry point used when a task is registered without a method name.
pub const DEFAULT_METHOD: &str = "run";

/// What a target returns: an optional result, or any error.
pub type TaskResult = anyhow::Result<Option<Value>>;

/// Context provided to targets during a firing.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Name of the task being fired.
    pub task_name: String,
    /// Group of the task being fired.
    pub group: String,
    /// Unique identifier for this firing.
    pub execution_id: String,
    /// When this firing started.
    pub fired_at: DateTime<Utc>,
    /// 1 for the first firing of the task.
    pub run_number: u64,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        task_name: impl Into<String>,
        group: impl Into<String>,
        fired_at: DateTime<Utc>,
        run_number: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            group: group.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            fired_at,
            run_number,
            cancel,
        }
    }

    /// True once the task was removed or its scheduler was forcibly shut down.
    ///
    /// Long-running targets should poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with an error once the firing has been cancelled.
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("task ({}) was cancelled", self.task_name);
        }
        Ok(())
    }

    /// Token that is cancelled together with the task.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Trait implemented by task targets.
///
/// A target exposes one or more entry points by name. Each firing invokes the
/// method the task was registered with, on a blocking worker thread.
pub trait Invocable: Send + Sync {
    /// Invoke the entry point `method`.
    fn invoke(&self, method: &str, ctx: &TaskContext) -> TaskResult;
}

/// Closures expose a single entry point and answer to any method name.
impl<F> Invocable for F
where
    F: Fn(&TaskContext) -> TaskResult + Send + Sync,
{
    fn invoke(&self, _method: &str, ctx: &TaskContext) -> TaskResult {
        self(ctx)
    }
}

type Method = Arc<dyn Fn(&TaskContext) -> TaskResult + Send + Sync>;

/// A target with several named entry points.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: Arc<HashMap<String, Method>>,
}

impl MethodTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry point.
    pub fn with_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.methods).insert(name.into(), Arc::new(method));
        self
    }

    /// Check if an entry point exists.
    pub fn has(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Entry point names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Invocable for MethodTable {
    fn invoke(&self, method: &str, ctx: &TaskContext) -> TaskResult {
        let Some(entry) = self.methods.get(method) else {
            anyhow::bail!(
                "no method named ({method}) on the target of task ({}). Available methods are {:?}",
                ctx.task_name,
                self.methods()
            );
        };
        entry(ctx)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TaskContext {
        TaskContext::new("report", "default", Utc::now(), 1, CancellationToken::new())
    }

    #[test]
    fn test_closure_target() {
        let target = |ctx: &TaskContext| -> TaskResult { Ok(Some(json!(ctx.run_number))) };
        let result = target.invoke(DEFAULT_METHOD, &ctx()).unwrap();
        assert_eq!(result, Some(json!(1)));
    }

    #[test]
    fn test_method_table_dispatch() {
        let table = MethodTable::new()
            .with_method("run", |_ctx: &TaskContext| Ok(Some(json!("ran"))))
            .with_method("cleanup", |_ctx: &TaskContext| Ok(None));

        assert!(table.has("cleanup"));
        assert_eq!(table.methods(), vec!["cleanup".to_string(), "run".to_string()]);
        assert_eq!(table.invoke("run", &ctx()).unwrap(), Some(json!("ran")));

        let err = table.invoke("missing", &ctx()).unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert!(err.to_string().contains("cleanup"));
    }

    #[test]
    fn test_cancellation_is_visible() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new("report", "default", Utc::now(), 3, token.clone());
        assert!(ctx.check_cancelled().is_ok());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.check_cancelled().is_err());
        assert_ne!(ctx.execution_id, TaskContext::new("report", "", Utc::now(), 3, token).execution_id);
    }
}
