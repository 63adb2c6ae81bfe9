//! `ixh run …` and `ixh errors …` commands.
//!
//! Each command opens the configured database, performs one store
//! operation (or, for `run work`, a whole indexing run), and prints a short
//! report to stdout in the same `label` / indented `key: value` shape.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDate, Utc};

use index_harness_core::clock::{Clock, SystemClock};
use index_harness_core::models::{IndexingRun, NewIndexingRun};
use index_harness_core::run::RunStatus;
use index_harness_core::store::{ErrorStore, RunStore};

use crate::config::{Config, FixtureConnectorConfig};
use crate::db;
use crate::progress::ProgressMode;
use crate::sources::ConnectorRegistry;
use crate::sqlite_store::SqliteStore;
use crate::worker::{new_worker_id, run_indexing, WorkerContext, WorkerSettings};

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(config).await?;
    Ok(Arc::new(SqliteStore::new(pool, config.chunking.max_tokens)))
}

/// Find a configured connector by `name` or `fixture:name`.
pub fn find_connector_config<'a>(
    config: &'a Config,
    requested: &str,
) -> Result<(&'a str, &'a FixtureConnectorConfig)> {
    let name = requested.strip_prefix("fixture:").unwrap_or(requested);
    config
        .connectors
        .fixture
        .get_key_value(name)
        .map(|(name, cfg)| (name.as_str(), cfg))
        .ok_or_else(|| {
            anyhow!(
                "No connector named '{}'. Run `ixh sources` to list configured connectors.",
                requested
            )
        })
}

/// Parse a `YYYY-MM-DD` bound. `end_of_day` selects 23:59:59 instead of midnight.
pub fn parse_date(value: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| anyhow!("invalid date '{}' (expected YYYY-MM-DD): {}", value, e))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| anyhow!("invalid date '{}'", value))
}

pub async fn create_run(
    config: &Config,
    connector: &str,
    search_settings_id: i64,
    from_beginning: bool,
    since: Option<String>,
    until: Option<String>,
) -> Result<()> {
    let (name, cfg) = find_connector_config(config, connector)?;
    let new = NewIndexingRun {
        cc_pair_id: cfg.cc_pair_id,
        search_settings_id,
        from_beginning,
        poll_range_start: since.as_deref().map(|s| parse_date(s, false)).transpose()?,
        poll_range_end: until.as_deref().map(|s| parse_date(s, true)).transpose()?,
    };

    let store = open_store(config).await?;
    let run = store.create_run(&new, SystemClock.now()).await?;
    println!("created run {} for fixture:{}", run.id, name);
    Ok(())
}

pub async fn work_run(
    config: &Config,
    run_id: i64,
    worker_id: Option<String>,
    progress: Option<ProgressMode>,
) -> Result<()> {
    let store = open_store(config).await?;
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow!("indexing run {} not found", run_id))?;

    let mut registry = ConnectorRegistry::from_config(config)?;
    let connector = registry.take(run.cc_pair_id).ok_or_else(|| {
        anyhow!(
            "no connector configured for cc_pair_id {} (run {})",
            run.cc_pair_id,
            run_id
        )
    })?;
    let label = connector.source_label();

    let settings = WorkerSettings {
        heartbeat_interval: config.coordination.heartbeat_interval(),
        max_concurrent_batches: config.coordination.max_concurrent_batches,
    };
    let reporter = progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();
    let ctx = WorkerContext::new(store.clone(), Arc::new(SystemClock), settings)
        .with_progress(Arc::from(reporter));

    let worker_id = worker_id.unwrap_or_else(new_worker_id);
    let run = run_indexing(&ctx, connector, run_id, &worker_id).await?;
    let open_errors = store.list_errors(run_id, true).await?.len();

    println!("run {} {}", run.id, label);
    print_run_counters(&run);
    println!("  open errors: {}", open_errors);

    if run.status == RunStatus::Failed {
        bail!(
            "run {} failed ({}): {}",
            run.id,
            run.failure_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            run.error_msg.as_deref().unwrap_or("")
        );
    }
    println!("{}", run.status);
    Ok(())
}

pub async fn cancel_run(config: &Config, run_id: i64) -> Result<()> {
    let store = open_store(config).await?;
    if store.request_cancellation(run_id, SystemClock.now()).await? {
        println!("cancellation requested for run {}", run_id);
    } else {
        let run = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("indexing run {} not found", run_id))?;
        println!("run {} already finished ({})", run_id, run.status);
    }
    Ok(())
}

pub async fn show_status(config: &Config, run_id: Option<i64>) -> Result<()> {
    let store = open_store(config).await?;
    match run_id {
        Some(run_id) => {
            let run = store
                .get_run(run_id)
                .await?
                .ok_or_else(|| anyhow!("indexing run {} not found", run_id))?;
            print_run_detail(&run);
        }
        None => {
            let runs = store.list_runs(None).await?;
            if runs.is_empty() {
                println!("No indexing runs.");
                return Ok(());
            }
            println!(
                "{:<6} {:<8} {:<12} {:<10} {:<8} CANCEL",
                "RUN", "CC_PAIR", "STATUS", "BATCHES", "DOCS"
            );
            for run in &runs {
                println!(
                    "{:<6} {:<8} {:<12} {:<10} {:<8} {}",
                    run.id,
                    run.cc_pair_id,
                    run.status,
                    batches(run),
                    run.total_docs_indexed,
                    run.cancellation_requested
                );
            }
        }
    }
    Ok(())
}

pub async fn list_errors(config: &Config, run_id: i64, include_resolved: bool) -> Result<()> {
    let store = open_store(config).await?;
    let errors = store.list_errors(run_id, !include_resolved).await?;
    if errors.is_empty() {
        println!("No errors for run {}.", run_id);
        return Ok(());
    }
    for e in &errors {
        let target = e
            .document_id
            .as_deref()
            .or(e.entity_id.as_deref())
            .unwrap_or("-");
        println!(
            "#{} [{}] {}: {}",
            e.id,
            if e.is_resolved { "resolved" } else { "open" },
            target,
            e.failure_message
        );
        if let (Some(start), Some(end)) = (e.failed_time_range_start, e.failed_time_range_end) {
            println!("    missed range: {} .. {}", start.to_rfc3339(), end.to_rfc3339());
        }
    }
    Ok(())
}

pub async fn resolve_error(config: &Config, error_id: i64) -> Result<()> {
    let store = open_store(config).await?;
    if !store.resolve_error(error_id).await? {
        bail!("error #{} not found", error_id);
    }
    println!("error #{} resolved", error_id);
    Ok(())
}

fn batches(run: &IndexingRun) -> String {
    match run.total_batches {
        Some(total) => format!("{}/{}", run.completed_batches, total),
        None => format!("{}/?", run.completed_batches),
    }
}

fn print_run_counters(run: &IndexingRun) {
    println!("  status: {}", run.status);
    println!("  batches: {}", batches(run));
    println!("  new documents: {}", run.new_docs_indexed);
    println!("  total documents: {}", run.total_docs_indexed);
    println!("  chunks: {}", run.total_chunks);
}

fn print_run_detail(run: &IndexingRun) {
    println!(
        "run {} (cc_pair {}, search settings {})",
        run.id, run.cc_pair_id, run.search_settings_id
    );
    print_run_counters(run);
    println!("  from beginning: {}", run.from_beginning);
    println!("  cancellation requested: {}", run.cancellation_requested);
    println!("  worker: {}", run.worker_id.as_deref().unwrap_or("-"));
    println!(
        "  heartbeat: {} (missed checks: {})",
        run.heartbeat_counter, run.missed_heartbeat_checks
    );
    if let Some(since) = run.stalled_since {
        println!("  stalled since: {}", since.to_rfc3339());
    }
    if let Some(pointer) = &run.checkpoint_pointer {
        println!("  checkpoint: {}", pointer);
    }
    if run.total_failures_batch_level > 0 {
        println!("  failed batches: {}", run.total_failures_batch_level);
    }
    if let Some(reason) = run.failure_reason {
        println!("  failure reason: {}", reason);
    }
    if let Some(msg) = &run.error_msg {
        println!("  error: {}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn date_bounds() {
        let start = parse_date("2024-03-01", false).unwrap();
        let end = parse_date("2024-03-01", true).unwrap();
        assert_eq!(start.hour(), 0);
        assert_eq!(end.hour(), 23);
        assert!(parse_date("03/01/2024", false).is_err());
    }
}
