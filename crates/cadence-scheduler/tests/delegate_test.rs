use cadence_scheduler::prelude::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Target that implements every hook but only declares some of them.
#[derive(Default)]
struct ReportJobs {
    configured: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl ReportJobs {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

impl DelegateTarget for ReportJobs {
    fn hooks(&self) -> HookSet {
        HookSet::empty()
            .with(Hook::OnStartup)
            .with(Hook::AfterAnyTask)
    }

    fn configure(&self, scheduler: &Scheduler) {
        self.configured.fetch_add(1, Ordering::SeqCst);
        scheduler
            .task("render")
            .call(|_ctx| Ok(Some(json!("rendered"))));
        scheduler.task("archive").every_day_at("03:00").call(|_ctx| Ok(None));
    }

    fn on_startup(&self, scheduler: &Scheduler) {
        self.record(format!("onStartup:{}", scheduler.len()));
    }

    // Not declared in hooks(); must never be called.
    fn on_shutdown(&self, _scheduler: &Scheduler) {
        self.record("onShutdown");
    }

    fn before_any_task(&self, task: &ScheduledTask) {
        self.record(format!("beforeAnyTask:{}", task.name()));
    }

    fn after_any_task(&self, task: &ScheduledTask, result: Option<&Value>) {
        let result = result.map(Value::to_string).unwrap_or_default();
        self.record(format!("afterAnyTask:{}:{result}", task.name()));
    }
}

#[tokio::test]
async fn test_delegate_forwards_only_declared_hooks() {
    let target = Arc::new(ReportJobs::default());
    let delegate = SchedulerDelegate::from_shared(Scheduler::builder("reports"), target.clone()).unwrap();

    assert!(delegate.overrides(Hook::OnStartup));
    assert!(delegate.overrides(Hook::AfterAnyTask));
    assert!(!delegate.overrides(Hook::OnShutdown));
    assert!(!delegate.overrides(Hook::BeforeAnyTask));

    delegate.configure().startup().await.unwrap();
    assert_eq!(target.configured.load(Ordering::SeqCst), 1);
    assert_eq!(delegate.registered_tasks(), vec!["archive", "render"]);

    assert!(wait_for(|| target.calls().iter().any(|c| c.starts_with("afterAnyTask"))).await);
    delegate.shutdown().await;

    let calls = target.calls();
    assert_eq!(calls, vec!["onStartup:2", "afterAnyTask:render:\"rendered\""]);
}

#[tokio::test]
async fn test_delegate_configure_runs_again_on_restart() {
    let target = Arc::new(ReportJobs::default());
    let delegate = SchedulerDelegate::from_shared(Scheduler::builder("restartable"), target.clone()).unwrap();

    delegate.configure().startup().await.unwrap();
    delegate.task("extra").every_hour().call(|_ctx| Ok(None));
    assert_eq!(delegate.len(), 3);

    delegate.restart(true, Duration::ZERO).await.unwrap();
    assert_eq!(target.configured.load(Ordering::SeqCst), 2);
    assert_eq!(delegate.registered_tasks(), vec!["archive", "render"]);
    assert!(delegate.has_started());

    delegate.shutdown_now().await;
}

#[tokio::test]
async fn test_delegate_without_overrides_uses_defaults() {
    struct ConfigureOnly;

    impl DelegateTarget for ConfigureOnly {
        fn configure(&self, scheduler: &Scheduler) {
            scheduler.task("noop").every_minute().call(|_ctx| Ok(None));
        }

        fn on_startup(&self, _scheduler: &Scheduler) {
            panic!("undeclared hook was called");
        }
    }

    let delegate = SchedulerDelegate::new(Scheduler::builder("plain"), ConfigureOnly).unwrap();
    assert!(Hook::ALL.iter().all(|hook| !delegate.overrides(*hook)));

    delegate.configure().startup().await.unwrap();
    assert!(delegate.get_task_record("noop").unwrap().is_live());

    let scheduler = delegate.clone().into_scheduler();
    assert!(scheduler.same_as(delegate.scheduler()));
    scheduler.shutdown().await;
    assert!(!delegate.has_started());
}

#[tokio::test]
async fn test_delegate_error_hook_sees_failures() {
    #[derive(Default)]
    struct Alerts {
        errors: Mutex<Vec<String>>,
    }

    impl DelegateTarget for Alerts {
        fn hooks(&self) -> HookSet {
            HookSet::empty().with(Hook::OnAnyTaskError)
        }

        fn configure(&self, scheduler: &Scheduler) {
            scheduler
                .task("flaky")
                .call(|_ctx| Err(anyhow::anyhow!("upstream timed out")));
        }

        fn on_any_task_error(&self, task: &ScheduledTask, err: &SchedulerError) {
            self.errors.lock().push(format!("{}: {}", task.name(), err.chain()));
        }
    }

    let target = Arc::new(Alerts::default());
    let delegate = SchedulerDelegate::from_shared(Scheduler::builder("alerts"), target.clone()).unwrap();
    delegate.configure().startup().await.unwrap();

    assert!(wait_for(|| !target.errors.lock().is_empty()).await);
    let errors = target.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("flaky: "));
    assert!(errors[0].contains("upstream timed out"));

    delegate.shutdown().await;
}
