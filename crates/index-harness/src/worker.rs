//! The indexing worker: drives one run from claim to terminal status.
//!
//! ```text
//! claim_run ──▶ heartbeat task ──▶ resolve start checkpoint
//!                                      │
//!      ┌───────────────────────────────┘
//!      ▼
//!  ┌─ should_stop? ─▶ dispatch_batch ─▶ load_from_checkpoint ─┐
//!  │                                                          │
//!  │   spawn: record failures, index docs, resolve errors ◀───┘
//!  │         (at most `max_concurrent_batches` in flight)
//!  │                       │
//!  │   sequencer releases batch n only after 0..n ──▶ save checkpoint
//!  │                                               ──▶ mark_batch_complete
//!  └── has_more ──────────────────────────────────────────────┘
//!        false ──▶ finalize_total_batches ──▶ drain ──▶ Success
//! ```
//!
//! Connector pulls are strictly sequential because each one consumes the
//! checkpoint the previous one returned. Only the indexing of pulled
//! documents runs concurrently. A checkpoint is persisted only once every
//! earlier batch has been indexed, so a crash at any point resumes from a
//! checkpoint whose batches are all durable: documents may be indexed
//! twice, never skipped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use index_harness_core::checkpoint::{Checkpoint, CheckpointSequencer};
use index_harness_core::clock::Clock;
use index_harness_core::connector::{
    CheckpointOutput, Connector, ConnectorOutput, Credentials, IndexingCallback,
};
use index_harness_core::coordinator::{BatchCoordinator, BatchHandle};
use index_harness_core::error::ConnectorError;
use index_harness_core::models::{BatchStats, IndexingRun, NewIndexAttemptError, RunFailure};
use index_harness_core::run::RunStatus;
use index_harness_core::store::{CheckpointStore, DocumentSink, ErrorStore, RunStore};

use crate::heartbeat::Heartbeat;
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress};

/// Tuning for one worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub heartbeat_interval: Duration,
    pub max_concurrent_batches: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_concurrent_batches: 4,
        }
    }
}

/// Everything a worker needs besides the connector.
#[derive(Clone)]
pub struct WorkerContext {
    pub runs: Arc<dyn RunStore>,
    pub errors: Arc<dyn ErrorStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub sink: Arc<dyn DocumentSink>,
    pub clock: Arc<dyn Clock>,
    pub settings: WorkerSettings,
    pub progress: Arc<dyn IndexProgressReporter>,
}

impl WorkerContext {
    /// Context over a single backend that implements every store trait.
    pub fn new<S>(store: Arc<S>, clock: Arc<dyn Clock>, settings: WorkerSettings) -> Self
    where
        S: RunStore + ErrorStore + CheckpointStore + DocumentSink + 'static,
    {
        Self {
            runs: store.clone(),
            errors: store.clone(),
            checkpoints: store.clone(),
            sink: store,
            clock,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn IndexProgressReporter>) -> Self {
        self.progress = progress;
        self
    }
}

/// A fresh worker identity.
pub fn new_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

/// Stop signal for one run: cancellation requested, or the run left
/// `InProgress` behind the worker's back (a monitor failed it).
pub struct RunCallback {
    runs: Arc<dyn RunStore>,
    run_id: i64,
}

impl RunCallback {
    pub fn new(runs: Arc<dyn RunStore>, run_id: i64) -> Self {
        Self { runs, run_id }
    }
}

#[async_trait]
impl IndexingCallback for RunCallback {
    async fn should_stop(&self) -> bool {
        match self.runs.get_run(self.run_id).await {
            Ok(Some(run)) => run.cancellation_requested || run.status != RunStatus::InProgress,
            Ok(None) => true,
            Err(e) => {
                warn!(run_id = self.run_id, error = %e, "stop check failed");
                false
            }
        }
    }

    async fn progress(&self, tag: &str, amount: u64) {
        debug!(run_id = self.run_id, tag, amount, "progress");
    }
}

/// How the indexing loop ended when it did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    Completed,
    /// Cancellation observed.
    Canceled,
    /// The run left `InProgress` without a cancellation request.
    Lost,
}

/// Where a run starts pulling from.
#[derive(Debug, Clone, PartialEq)]
pub struct StartPoint {
    pub checkpoint: Checkpoint,
    pub resumed: bool,
}

/// Pick the checkpoint a run starts from.
///
/// - `from_beginning` runs, and runs with no stored checkpoint, start from
///   the connector's dummy checkpoint.
/// - Otherwise the latest stored checkpoint for the run's key is validated
///   by the connector. One with `has_more = false` marks a finished
///   previous run, so a fresh pass starts from the dummy checkpoint.
/// - A blob the connector rejects is [`ConnectorError::MalformedCheckpoint`].
pub async fn resolve_start_checkpoint(
    checkpoints: &dyn CheckpointStore,
    connector: &dyn Connector,
    run: &IndexingRun,
) -> Result<StartPoint, ConnectorError> {
    let fresh = StartPoint {
        checkpoint: connector.build_dummy_checkpoint(),
        resumed: false,
    };
    if run.from_beginning {
        return Ok(fresh);
    }
    let record = match checkpoints.latest_checkpoint(run.checkpoint_key()).await? {
        Some(record) => record,
        None => return Ok(fresh),
    };
    let checkpoint = connector.validate_checkpoint(&record.blob)?;
    if !checkpoint.has_more {
        return Ok(fresh);
    }
    debug!(
        run_id = run.id,
        from_run = record.run_id,
        sequence = record.sequence,
        "resuming from stored checkpoint"
    );
    Ok(StartPoint {
        checkpoint,
        resumed: true,
    })
}

/// Claim `run_id` and index it to a terminal status.
///
/// Returns the run record as it stands afterwards. Connector and indexing
/// failures end the run in `Failed` and are not returned as errors; an
/// error here means the run could not be claimed or the store itself
/// failed.
pub async fn run_indexing(
    ctx: &WorkerContext,
    mut connector: Box<dyn Connector>,
    run_id: i64,
    worker_id: &str,
) -> Result<IndexingRun> {
    let label = connector.source_label();

    if !ctx.runs.claim_run(run_id, worker_id, ctx.clock.now()).await? {
        return settle_unclaimed(ctx, run_id).await;
    }
    let run = fetch_run(ctx.runs.as_ref(), run_id).await?;
    info!(run_id, worker_id, connector = %label, "run claimed");

    let heartbeat = Heartbeat::spawn(
        ctx.runs.clone(),
        ctx.clock.clone(),
        run_id,
        ctx.settings.heartbeat_interval,
    );
    let outcome = index_run(ctx, connector.as_mut(), &run).await;
    heartbeat.stop().await;

    let now = ctx.clock.now();
    let (to, failure) = match outcome {
        Ok(LoopEnd::Completed) => (RunStatus::Success, None),
        Ok(LoopEnd::Canceled) | Err(ConnectorError::Stopped(_)) => (RunStatus::Canceled, None),
        Ok(LoopEnd::Lost) => {
            warn!(run_id, "run left in_progress while working; not finalizing");
            return fetch_run(ctx.runs.as_ref(), run_id).await;
        }
        Err(e) => {
            error!(run_id, connector = %label, error = %e, "indexing failed");
            let failure = RunFailure::new(e.failure_reason(), e.to_string())
                .with_trace(format!("{:?}", e));
            (RunStatus::Failed, Some(failure))
        }
    };

    if ctx
        .runs
        .transition(run_id, RunStatus::InProgress, to, failure.as_ref(), now)
        .await?
    {
        info!(run_id, status = %to, "run finished");
    } else {
        warn!(run_id, status = %to, "run already left in_progress; status not applied");
    }

    let run = fetch_run(ctx.runs.as_ref(), run_id).await?;
    ctx.progress.report(IndexProgressEvent::Finished {
        connector: label,
        run_id,
        status: run.status.to_string(),
    });
    Ok(run)
}

/// A claim lost to cancellation moves the run straight to `Canceled`.
async fn settle_unclaimed(ctx: &WorkerContext, run_id: i64) -> Result<IndexingRun> {
    let run = fetch_run(ctx.runs.as_ref(), run_id).await?;
    if run.status == RunStatus::NotStarted && run.cancellation_requested {
        ctx.runs
            .transition(
                run_id,
                RunStatus::NotStarted,
                RunStatus::Canceled,
                None,
                ctx.clock.now(),
            )
            .await?;
        info!(run_id, "run canceled before it started");
        return fetch_run(ctx.runs.as_ref(), run_id).await;
    }
    bail!(
        "indexing run {} could not be claimed (status {}, worker {})",
        run_id,
        run.status,
        run.worker_id.as_deref().unwrap_or("-")
    )
}

async fn fetch_run(runs: &dyn RunStore, run_id: i64) -> Result<IndexingRun> {
    runs.get_run(run_id)
        .await?
        .ok_or_else(|| anyhow!("indexing run {} not found", run_id))
}

/// A batch whose documents have been indexed, waiting for its turn to
/// persist its checkpoint.
struct IndexedBatch {
    handle: BatchHandle,
    stats: BatchStats,
    checkpoint: Checkpoint,
}

async fn index_run(
    ctx: &WorkerContext,
    connector: &mut dyn Connector,
    run: &IndexingRun,
) -> Result<LoopEnd, ConnectorError> {
    connector.load_credentials(&Credentials::new()).await?;

    let start = resolve_start_checkpoint(ctx.checkpoints.as_ref(), connector, run).await?;
    let label = connector.source_label();
    ctx.progress.report(IndexProgressEvent::Started {
        connector: label.clone(),
        run_id: run.id,
        resumed: start.resumed,
    });

    let coordinator = BatchCoordinator::new(ctx.runs.clone(), ctx.clock.clone());
    let callback = RunCallback::new(ctx.runs.clone(), run.id);
    let perm_sync = connector.supports_perm_sync();
    let window_start = run.poll_range_start.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let window_end = run.poll_range_end.unwrap_or_else(|| ctx.clock.now());
    let max_in_flight = ctx.settings.max_concurrent_batches.max(1);

    let mut checkpoint = start.checkpoint;
    let mut in_flight: JoinSet<Result<IndexedBatch, ConnectorError>> = JoinSet::new();
    let mut sequencer = CheckpointSequencer::new();
    let mut stopped = false;
    let mut pull_error = None;

    loop {
        if callback.should_stop().await {
            stopped = true;
            break;
        }
        let handle = match coordinator.dispatch_batch(run.id).await? {
            Some(handle) => handle,
            None => {
                stopped = true;
                break;
            }
        };

        let pulled = if perm_sync {
            connector
                .load_from_checkpoint_with_perm_sync(window_start, window_end, &checkpoint)
                .await
                .and_then(|output| check_access_contract(&output).map(|_| output))
        } else {
            connector
                .load_from_checkpoint(window_start, window_end, &checkpoint)
                .await
        };
        let output = match pulled {
            Ok(output) => output,
            Err(e) => {
                note_batch_failure(ctx, run.id).await;
                pull_error = Some(e);
                break;
            }
        };

        while in_flight.len() >= max_in_flight {
            if let Some(joined) = in_flight.join_next().await {
                release(ctx, &coordinator, &mut sequencer, run, &label, joined).await?;
            }
        }

        checkpoint = output.checkpoint.clone();
        in_flight.spawn(index_batch(
            ctx.sink.clone(),
            ctx.errors.clone(),
            ctx.clock.clone(),
            run.clone(),
            handle,
            output,
        ));

        if !checkpoint.has_more {
            coordinator
                .finalize_total_batches(run.id, handle.sequence + 1)
                .await?;
            break;
        }
    }

    // Batches already pulled are indexed and checkpointed even when the
    // loop ended on an error, so a retry resumes past them.
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = release(ctx, &coordinator, &mut sequencer, run, &label, joined).await {
            if pull_error.is_none() {
                return Err(e);
            }
            warn!(run_id = run.id, error = %e, "batch failed while draining after a pull error");
        }
    }
    if let Some(e) = pull_error {
        return Err(e);
    }

    if stopped {
        let current = fetch_run(ctx.runs.as_ref(), run.id).await?;
        return Ok(if current.cancellation_requested {
            info!(run_id = run.id, "cancellation observed; in-flight batches drained");
            LoopEnd::Canceled
        } else {
            LoopEnd::Lost
        });
    }

    if !coordinator.is_coordination_complete(run.id).await? {
        return Err(ConnectorError::Other(anyhow!(
            "run {} finished pulling but batch coordination is incomplete",
            run.id
        )));
    }
    Ok(LoopEnd::Completed)
}

/// Every document of a perm-sync pull must carry access.
fn check_access_contract(output: &CheckpointOutput) -> Result<(), ConnectorError> {
    match output.documents().find(|doc| doc.external_access.is_none()) {
        Some(doc) => Err(ConnectorError::PermissionContract(format!(
            "document {} yielded by a perm-sync load has no external access",
            doc.id
        ))),
        None => Ok(()),
    }
}

/// Persist checkpoints for every batch the sequencer can now release, in
/// order, then count them complete.
async fn release(
    ctx: &WorkerContext,
    coordinator: &BatchCoordinator,
    sequencer: &mut CheckpointSequencer<IndexedBatch>,
    run: &IndexingRun,
    label: &str,
    joined: Result<Result<IndexedBatch, ConnectorError>, tokio::task::JoinError>,
) -> Result<(), ConnectorError> {
    let indexed = joined
        .map_err(|e| ConnectorError::Other(anyhow!("batch task failed: {}", e)))
        .and_then(|result| result);
    let batch = match indexed {
        Ok(batch) => batch,
        Err(e) => {
            note_batch_failure(ctx, run.id).await;
            return Err(e);
        }
    };
    for (sequence, batch) in sequencer.push(batch.handle.sequence, batch) {
        let now = ctx.clock.now();
        let record = ctx
            .checkpoints
            .save_checkpoint(run, sequence, &batch.checkpoint, now)
            .await?;
        ctx.runs
            .set_checkpoint_pointer(run.id, &record.pointer, now)
            .await?;
        let updated = coordinator
            .mark_batch_complete(&batch.handle, &batch.stats)
            .await?;
        ctx.progress.report(IndexProgressEvent::Batch {
            connector: label.to_string(),
            run_id: run.id,
            completed: updated.completed_batches.max(0) as u64,
            docs: updated.total_docs_indexed.max(0) as u64,
        });
    }
    Ok(())
}

/// Count a failed batch on the run before the failure ends it.
async fn note_batch_failure(ctx: &WorkerContext, run_id: i64) {
    match ctx.runs.record_batch_failure(run_id, ctx.clock.now()).await {
        Ok(count) => debug!(run_id, count, "batch failure recorded"),
        Err(e) => warn!(run_id, error = %e, "could not record batch failure"),
    }
}

async fn index_batch(
    sink: Arc<dyn DocumentSink>,
    errors: Arc<dyn ErrorStore>,
    clock: Arc<dyn Clock>,
    run: IndexingRun,
    handle: BatchHandle,
    output: CheckpointOutput,
) -> Result<IndexedBatch, ConnectorError> {
    let mut docs = Vec::new();
    for item in output.items {
        match item {
            ConnectorOutput::Document(doc) => docs.push(doc),
            ConnectorOutput::Failure(failure) => {
                warn!(
                    run_id = run.id,
                    batch = handle.sequence,
                    message = %failure.message,
                    "connector reported a failure"
                );
                errors
                    .record_error(&NewIndexAttemptError::from_failure(&run, &failure), clock.now())
                    .await?;
            }
        }
    }

    let stats = sink.index_documents(&run, &docs, clock.now()).await?;
    if !docs.is_empty() {
        let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        let resolved = errors
            .resolve_errors_for_documents(run.cc_pair_id, &ids)
            .await?;
        if resolved > 0 {
            debug!(run_id = run.id, resolved, "earlier document errors resolved");
        }
    }

    Ok(IndexedBatch {
        handle,
        stats,
        checkpoint: output.checkpoint,
    })
}
