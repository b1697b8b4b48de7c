//! Basic scheduler example
//!
//! Demonstrates:
//! - Immediate one-shot tasks
//! - Fixed-rate and fixed-delay repetition
//! - Task hooks and run statistics

use cadence_scheduler::prelude::*;
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("cadence_scheduler=debug,basic_scheduler=debug")
        .init();

    println!("=== Cadence Scheduler Example ===\n");

    let scheduler = Scheduler::builder("basic")
        .with_shutdown_timeout(Duration::from_secs(5))
        .build()?;

    // Runs once, right after startup
    scheduler
        .task("welcome")
        .call(|ctx| {
            println!("[{}] Welcome to Cadence Scheduler!", ctx.task_name);
            Ok(None)
        });

    // Every 3 seconds, on schedule even if a firing runs long
    scheduler
        .task("heartbeat")
        .call(|ctx| {
            println!("[{}] Heartbeat #{}", ctx.task_name, ctx.run_number);
            Ok(Some(json!({ "beat": ctx.run_number })))
        })
        .every(3, TimeUnit::Seconds)
        .after(|task, result| {
            if let Some(result) = result {
                println!("[{}] after: {result}", task.name());
            }
        });

    // 5 seconds between the end of one firing and the start of the next
    scheduler
        .task_in_group("background-work", "workers")
        .call(|ctx| {
            println!("[{}] Starting work (run #{})", ctx.task_name, ctx.run_number);
            std::thread::sleep(Duration::from_millis(500));
            ctx.check_cancelled()?;
            println!("[{}] Work completed", ctx.task_name);
            Ok(Some(json!({ "execution_id": ctx.execution_id })))
        })
        .spaced_delay(5, TimeUnit::Seconds)
        .on_failure(|task, err| eprintln!("[{}] failed: {}", task.name(), err.chain()));

    println!("Tasks registered. Running for 30 seconds (for demo)...\n");
    scheduler.startup().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, stopping scheduler...");
        }
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            println!("\nDemo timeout reached, stopping scheduler...");
        }
    }

    scheduler.shutdown().await;

    println!("\nTask stats:");
    println!("{}", serde_json::to_string_pretty(&scheduler.task_stats()).unwrap_or_default());
    println!("Scheduler stopped.");
    Ok(())
}
