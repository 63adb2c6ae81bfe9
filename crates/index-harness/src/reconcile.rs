//! `ixh reconcile`: the heartbeat and stall monitor loop.
//!
//! Runs a [`LivenessMonitor`] sweep over every in-progress run once per
//! `monitor_interval`. Any number of reconcilers may run against the same
//! database; every failure they write is a compare-and-swap, so two of
//! them racing on one run fail it once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use index_harness_core::clock::SystemClock;
use index_harness_core::liveness::{LivenessMonitor, SweepReport};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub async fn run_reconcile(config: &Config, once: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool, config.chunking.max_tokens));
    let monitor = LivenessMonitor::new(
        store,
        Arc::new(SystemClock),
        config.coordination.monitor_config(),
    );

    if once {
        let report = monitor.sweep().await?;
        print_report(&report);
        return Ok(());
    }

    reconcile_loop(&monitor, config.coordination.monitor_interval()).await
}

/// Sweep every `interval` until Ctrl-C.
async fn reconcile_loop(monitor: &LivenessMonitor, interval: Duration) -> Result<()> {
    info!(interval_secs = interval.as_secs(), "reconciler started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match monitor.sweep().await {
                    Ok(report) if report.checked > 0 => {
                        info!(
                            checked = report.checked,
                            healthy = report.healthy,
                            stalled = report.stalled,
                            failed_stalled = report.failed_stalled,
                            failed_dead = report.failed_dead,
                            errors = report.errors,
                            "sweep complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "sweep failed; retrying next tick"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("reconciler stopping");
                return Ok(());
            }
        }
    }
}

fn print_report(report: &SweepReport) {
    println!("reconcile");
    println!("  runs checked: {}", report.checked);
    println!("  healthy: {}", report.healthy);
    println!("  stalled: {}", report.stalled);
    println!("  failed (stalled): {}", report.failed_stalled);
    println!("  failed (dead worker): {}", report.failed_dead);
    println!("  errors: {}", report.errors);
}
