//! Certiva Background Worker
//!
//! Handles scheduled jobs including:
//! - Stale sync workflow sweep (every minute)
//! - Daily sync invariant checks (4:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use certiva_sync::{InvariantChecker, SyncRecordStore, ViolationSeverity};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Workflows pending longer than this are treated as abandoned.
const DEFAULT_WORKFLOW_TIMEOUT_MINUTES: i64 = 10;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Certiva Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Sweep stale sync workflows (every minute)
    // A workflow whose process died leaves its record pending forever;
    // the sweep fails those records and dead-letters them for retry.
    let sweep_records = SyncRecordStore::new(pool.clone());
    let timeout_minutes = std::env::var("SYNC_WORKFLOW_TIMEOUT_MINUTES")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(DEFAULT_WORKFLOW_TIMEOUT_MINUTES);
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let records = sweep_records.clone();
            Box::pin(async move {
                match records.sweep_stale(timeout_minutes).await {
                    Ok(report) if report.swept > 0 => {
                        warn!(
                            swept = report.swept,
                            dead_lettered = report.dead_lettered,
                            "Swept stale sync workflows"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Stale workflow sweep failed");
                    }
                }
            })
        })?)
        .await?;
    info!(
        timeout_minutes = timeout_minutes,
        "Scheduled: Stale sync workflow sweep (every minute)"
    );

    // Job 2: Run sync invariant checks (daily at 4:00 AM UTC)
    let invariant_checker = Arc::new(InvariantChecker::new(pool.clone()));
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running daily sync invariant checks");

                let summary = match checker.run_all_checks().await {
                    Ok(summary) => summary,
                    Err(e) => {
                        error!(error = %e, "Invariant check run failed");
                        return;
                    }
                };

                if summary.healthy {
                    info!(
                        checks_run = summary.checks_run,
                        "All sync invariants hold"
                    );
                    return;
                }

                for violation in &summary.violations {
                    match violation.severity {
                        ViolationSeverity::Critical | ViolationSeverity::High => {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                entity_ids = ?violation.entity_ids,
                                description = %violation.description,
                                "Sync invariant violated"
                            );
                        }
                        ViolationSeverity::Medium => {
                            warn!(
                                invariant = %violation.invariant,
                                entity_ids = ?violation.entity_ids,
                                description = %violation.description,
                                "Sync invariant violated"
                            );
                        }
                        ViolationSeverity::Low => {
                            info!(
                                invariant = %violation.invariant,
                                entity_ids = ?violation.entity_ids,
                                description = %violation.description,
                                "Sync invariant violated"
                            );
                        }
                    }
                }

                warn!(
                    checks_run = summary.checks_run,
                    checks_failed = summary.checks_failed,
                    violations = summary.violations.len(),
                    "Daily invariant check found violations"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Sync invariant checks (daily at 4:00 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Certiva Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
