use cadence_scheduler::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn scheduler_with_task(name: &str) -> Scheduler {
    let scheduler = Scheduler::new(name).unwrap();
    scheduler.task("tick").every_hour().call(|_ctx| Ok(None));
    scheduler
}

#[tokio::test]
async fn test_register_and_lookup() {
    let service = SchedulerService::new();
    assert!(service.is_empty());

    service.register_scheduler(scheduler_with_task("billing"), false).await.unwrap();
    service.register_scheduler(scheduler_with_task("audit"), false).await.unwrap();

    assert_eq!(service.len(), 2);
    assert!(service.has_scheduler("billing"));
    assert_eq!(service.scheduler_names(), vec!["audit", "billing"]);
    assert_eq!(service.get_scheduler("audit").unwrap().name(), "audit");
    assert!(service.get_scheduler("missing").is_none());
}

#[tokio::test]
async fn test_missing_scheduler_error_lists_names() {
    let service = SchedulerService::new();
    service.register_scheduler(scheduler_with_task("billing"), false).await.unwrap();
    service.register_scheduler(scheduler_with_task("audit"), false).await.unwrap();

    let err = service.get_scheduler_or_fail("reports").unwrap_err();
    assert!(matches!(err, SchedulerError::SchedulerNotFound { .. }));
    let message = err.to_string();
    assert!(message.contains("reports"));
    assert!(message.contains("audit"));
    assert!(message.contains("billing"));

    assert!(service.startup_scheduler("reports").await.is_err());
    assert!(service.scheduler_stats("reports").is_err());
}

#[tokio::test]
async fn test_duplicate_registration() {
    let service = SchedulerService::new();
    let previous = service.register_and_start(scheduler_with_task("jobs"), false).await.unwrap();
    assert!(previous.has_started());

    let err = service
        .register_scheduler(scheduler_with_task("jobs"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::SchedulerExists(ref name) if name == "jobs"));
    assert!(service.get_scheduler("jobs").unwrap().same_as(&previous));

    // Forced replacement shuts the old scheduler down.
    let replacement = service.register_scheduler(scheduler_with_task("jobs"), true).await.unwrap();
    assert!(!previous.has_started());
    assert!(previous.pool().is_none());
    assert!(service.get_scheduler("jobs").unwrap().same_as(&replacement));
    assert_eq!(service.len(), 1);

    // Re-registering the same scheduler with force leaves it running.
    service.startup_scheduler("jobs").await.unwrap();
    service.register_scheduler(replacement.clone(), true).await.unwrap();
    assert!(replacement.has_started());

    service.shutdown_all(true).await;
}

#[tokio::test]
async fn test_startup_and_shutdown_all() {
    let service = SchedulerService::new();
    for name in ["a", "b", "c"] {
        service.register_scheduler(scheduler_with_task(name), false).await.unwrap();
    }

    service.startup_all().await;
    for name in service.scheduler_names() {
        let scheduler = service.get_scheduler_or_fail(&name).unwrap();
        assert!(scheduler.has_started(), "{name} should be running");
        assert!(scheduler.get_task_record("tick").unwrap().is_live());
    }

    service.shutdown_all(false).await;
    for name in service.scheduler_names() {
        assert!(!service.get_scheduler(&name).unwrap().has_started());
    }
}

#[tokio::test]
async fn test_shutdown_and_restart_single_scheduler() {
    let service = SchedulerService::new();
    service.register_and_start(scheduler_with_task("etl"), false).await.unwrap();

    let scheduler = service.shutdown_scheduler("etl", false, Duration::from_secs(1)).await.unwrap();
    assert!(!scheduler.has_started());

    service.restart_scheduler("etl", true, Duration::ZERO).await.unwrap();
    assert!(scheduler.has_started());

    service.shutdown_all(true).await;
}

#[tokio::test]
async fn test_remove_and_clear() {
    let service = SchedulerService::new();
    let kept = service.register_and_start(scheduler_with_task("kept"), false).await.unwrap();
    let removed = service.register_and_start(scheduler_with_task("removed"), false).await.unwrap();

    assert!(service.remove_scheduler("removed", true, Duration::ZERO).await);
    assert!(!service.remove_scheduler("removed", true, Duration::ZERO).await);
    assert!(!removed.has_started());
    assert_eq!(service.scheduler_names(), vec!["kept"]);

    service.clear_schedulers(true, Duration::ZERO).await;
    assert!(service.is_empty());
    assert!(!kept.has_started());
}

#[tokio::test]
async fn test_stats_across_schedulers() {
    let service = SchedulerService::new();
    let first = Scheduler::new("first").unwrap();
    first.task("x").every_hour();
    first.task("y").every_day();
    service.register_scheduler(first, false).await.unwrap();
    service.register_scheduler(scheduler_with_task("second"), false).await.unwrap();

    let stats = service.scheduler_stats("first").unwrap();
    assert_eq!(stats.keys().cloned().collect::<Vec<_>>(), vec!["x", "y"]);

    let all = service.all_stats();
    assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["first", "second"]);
    assert!(all["second"]["tick"].never_run);
}

#[tokio::test]
async fn test_load_scheduler_runs_configure() {
    let configured = Arc::new(AtomicUsize::new(0));
    let calls = configured.clone();
    let scheduler = Scheduler::builder("loaded")
        .with_lifecycle(ConfigureFn::new(move |scheduler: &Scheduler| {
            calls.fetch_add(1, Ordering::SeqCst);
            scheduler.task("sync").every_minute().call(|_ctx| Ok(None));
        }))
        .build()
        .unwrap();

    let service = SchedulerService::new();
    service.register_scheduler(scheduler_with_task("loaded"), false).await.unwrap();

    // Loading replaces whatever was registered under the name.
    let loaded = service.load_scheduler(scheduler).await.unwrap();
    assert_eq!(configured.load(Ordering::SeqCst), 1);
    assert_eq!(loaded.registered_tasks(), vec!["sync"]);
    assert!(service.get_scheduler("loaded").unwrap().same_as(&loaded));
    assert!(!loaded.has_started());
}
