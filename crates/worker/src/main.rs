//! RelayPass Background Worker
//!
//! Runs the reconciliation loop plus scheduled jobs:
//! - Reconcile cycle: reminders, expiry, credential hygiene (configurable interval)
//! - Settlement repair for completed payments missing their grant (every 15 minutes)
//! - Ledger invariant sweep with operator escalation (daily at 2:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use relaypass_core::{AuditKind, AuditOutcome, CoreService};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

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

    info!("Starting RelayPass Worker");

    let pool = create_db_pool().await?;
    let core = Arc::new(CoreService::from_env(pool.clone())?);

    // Reconciliation loop with graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = core.reconciler.clone();
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run_loop(shutdown_rx).await;
    });

    let scheduler = JobScheduler::new().await?;

    // Job 1: Settlement repair (every 15 minutes)
    // Completed payments whose grant step failed get their effects re-applied.
    let repair_core = core.clone();
    let repair_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let core = repair_core.clone();
            let pool = repair_pool.clone();
            Box::pin(async move {
                let stranded: Vec<i64> = match sqlx::query_scalar(
                    "SELECT id FROM payments \
                     WHERE status = 'completed' AND grant_id IS NULL AND plan_id IS NOT NULL \
                     ORDER BY completed_at LIMIT 100",
                )
                .fetch_all(&pool)
                .await
                {
                    Ok(ids) => ids,
                    Err(e) => {
                        error!(error = %e, "Stranded settlement query failed");
                        return;
                    }
                };

                if stranded.is_empty() {
                    return;
                }
                info!(count = stranded.len(), "Repairing stranded settlements");

                let mut repaired = 0;
                let mut errors = 0;
                for payment_id in stranded {
                    match core.payments.reconcile_settlement(payment_id).await {
                        Ok(grant_id) => {
                            repaired += 1;
                            let detail = format!(
                                "payment {payment_id} -> grant {}",
                                grant_id.map_or("none".to_string(), |g| g.to_string())
                            );
                            if let Err(e) = core
                                .audit
                                .record(
                                    AuditKind::SettlementRepaired,
                                    None,
                                    AuditOutcome::Success,
                                    Some(&detail),
                                )
                                .await
                            {
                                warn!(error = %e, "Could not audit settlement repair");
                            }
                        }
                        Err(e) => {
                            errors += 1;
                            error!(payment_id, error = %e, "Settlement repair failed");
                        }
                    }
                }
                info!(repaired, errors, "Settlement repair cycle complete");
            })
        })?)
        .await?;
    info!("Scheduled: Settlement repair (every 15 minutes)");

    // Job 2: Ledger invariant sweep (daily at 2:00 AM UTC)
    let sweep_core = core.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let core = sweep_core.clone();
            Box::pin(async move {
                info!("Running ledger invariant sweep");
                match core.invariants.run_all_checks().await {
                    Ok(summary) => {
                        info!(
                            checks_run = summary.checks_run,
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            healthy = summary.healthy,
                            "Invariant sweep complete"
                        );
                        if !summary.healthy {
                            for violation in &summary.violations {
                                warn!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    description = %violation.description,
                                    "Invariant violation"
                                );
                            }
                            core.notifier
                                .alert_operator(&format!(
                                    "Invariant sweep found {} violation(s) across {} check(s)",
                                    summary.violations.len(),
                                    summary.checks_failed
                                ))
                                .await;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Invariant sweep failed");
                        core.notifier
                            .alert_operator(&format!("Invariant sweep failed: {e}"))
                            .await;
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant sweep (daily at 2:00 AM UTC)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("RelayPass Worker started successfully with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping reconciler");
    let _ = shutdown_tx.send(true);
    let _ = reconcile_handle.await;

    Ok(())
}
