//! Auto-manage passes and maintenance flows.

use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;

use autotrade_manager::{AutoManager, MaintenanceSummary, RunStatus};

use super::print_json;
use crate::context::AppContext;

/// Runs the periodic service until Ctrl+C.
pub async fn run_service(ctx: &AppContext, interval: Option<u64>) -> Result<()> {
    let secs = interval.unwrap_or(ctx.config.manager.run_interval_secs).max(1);
    tracing::info!("Starting auto-manage service every {}s", secs);

    let passes = run_every(&ctx.manager, Duration::from_secs(secs), async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, stopping auto-manage service"),
            Err(e) => tracing::error!(error = %e, "signal handler failed, stopping auto-manage service"),
        }
    })
    .await;
    tracing::info!(passes, "auto-manage service stopped");
    Ok(())
}

/// Runs a pass on every tick until `shutdown` resolves. A pass in flight is
/// allowed to finish. Returns the number of completed passes.
pub async fn run_every(
    manager: &AutoManager,
    interval: Duration,
    shutdown: impl Future<Output = ()>,
) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut passes = 0;
    loop {
        tokio::select! {
            biased;
            () = &mut shutdown => return passes,
            _ = ticker.tick() => {}
        }
        let summary = manager.run_auto_manage(Utc::now()).await;
        passes += 1;
        let c = summary.counts;
        tracing::info!(
            run_id = %summary.run_id,
            status = %summary.status,
            checked = c.checked,
            cut_loss = c.cut_loss,
            tightened = c.tightened,
            rescued = c.rescued,
            broker_flat = c.broker_flat,
            errors = c.errors,
            "auto-manage run finished"
        );
    }
}

pub async fn auto_manage(ctx: &AppContext) -> Result<()> {
    let summary = ctx.manager.run_auto_manage(Utc::now()).await;
    print_json(&summary)?;
    if summary.status != RunStatus::Completed {
        tracing::warn!(status = %summary.status, "auto-manage pass did not run to completion");
    }
    Ok(())
}

pub async fn finalize(ctx: &AppContext) -> Result<()> {
    report(ctx.manager.finalize_recent_closes(Utc::now()).await)
}

pub async fn rescue_stops(ctx: &AppContext) -> Result<()> {
    report(ctx.manager.rescue_missing_stops(Utc::now()).await)
}

pub async fn runs(ctx: &AppContext, limit: usize) -> Result<()> {
    let runs = ctx.manager.recent_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in &runs {
        let c = run.counts;
        println!(
            "{}  {:<18} {:<10} checked={} cut_loss={} tightened={} rescued={} flat={} dup={} errors={}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.run_id,
            run.status,
            c.checked,
            c.cut_loss,
            c.tightened,
            c.rescued,
            c.broker_flat,
            c.duplicates,
            c.errors
        );
    }
    Ok(())
}

pub(crate) fn report(summary: MaintenanceSummary) -> Result<()> {
    print_json(&summary)?;
    tracing::info!(
        operation = %summary.operation,
        checked = summary.checked,
        updated = summary.updated,
        errors = summary.errors,
        "maintenance finished"
    );
    Ok(())
}
