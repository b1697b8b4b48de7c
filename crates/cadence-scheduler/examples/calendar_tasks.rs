//! Calendar scheduling example
//!
//! Demonstrates:
//! - Daily, weekly and monthly calendar tasks
//! - Business-day and weekday constraints in a named timezone
//! - A lifecycle that registers tasks in `configure`
//! - Hosting schedulers in a `SchedulerService`

use cadence_scheduler::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Registers the reporting tasks and announces startup.
struct Reporting {
    market_open: Arc<AtomicBool>,
}

impl SchedulerLifecycle for Reporting {
    fn configure(&self, scheduler: &Scheduler) {
        scheduler
            .task("daily-summary")
            .call(|ctx| {
                println!("[{}] Building daily summary", ctx.task_name);
                Ok(Some(json!({ "rows": 1250 })))
            })
            .every_day_at("06:30");

        scheduler
            .task("weekly-digest")
            .call(|ctx| {
                println!("[{}] Sending weekly digest", ctx.task_name);
                Ok(None)
            })
            .on_mondays("08:00");

        scheduler
            .task_in_group("month-end-close", "finance")
            .call(|ctx| {
                println!("[{}] Closing the books", ctx.task_name);
                Ok(None)
            })
            .on_last_business_day_of_the_month("17:00")
            .with_no_overlaps();

        let market_open = self.market_open.clone();
        scheduler
            .task("price-poll")
            .call(|ctx| {
                println!("[{}] Polling prices (run #{})", ctx.task_name, ctx.run_number);
                Ok(None)
            })
            .every(15, TimeUnit::Minutes)
            .between("09:30", "16:00")
            .when(move |_task| market_open.load(Ordering::SeqCst));

        scheduler
            .xtask("legacy-export")
            .call(|_ctx| Ok(None))
            .every_month_on(1, "00:15");
    }

    fn on_startup(&self, scheduler: &Scheduler) {
        println!(
            "Scheduler ({}) started in {} with {} tasks",
            scheduler.name(),
            scheduler.timezone(),
            scheduler.len()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("cadence_scheduler=info,calendar_tasks=debug")
        .init();

    let scheduler = Scheduler::builder("reporting")
        .with_timezone("America/New_York")
        .with_lifecycle(Reporting {
            market_open: Arc::new(AtomicBool::new(true)),
        })
        .build()?;

    let service = SchedulerService::new();
    service.load_scheduler(scheduler).await?;
    service.startup_all().await;

    for (scheduler, tasks) in service.all_stats() {
        for (task, stats) in tasks {
            let next = stats
                .next_run
                .map(|next| next.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            println!("{scheduler}/{task}: next run {next}");
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
    }

    service.shutdown_all(false).await;
    Ok(())
}
