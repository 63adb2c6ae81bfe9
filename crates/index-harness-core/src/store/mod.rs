//! Storage abstraction for indexing coordination.
//!
//! The run record is the single shared mutable resource between workers
//! and monitors, so every mutation here is specified as one atomic step:
//! counter increments never lose updates and status changes are
//! compare-and-swap. No in-process memory is shared between workers; a
//! backend that honours these traits is all the coordination there is.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`RunStore`] | Indexing run records: claim, transitions, counters, liveness |
//! | [`ErrorStore`] | Append-only per-document failure rows |
//! | [`CheckpointStore`] | Ordered, durable checkpoint blobs |
//! | [`DocumentSink`] | Where indexed documents and their access land |
//!
//! [`memory::InMemoryStore`] implements all four.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, CheckpointRecord};
use crate::models::{
    BatchStats, CheckpointKey, DocExternalAccess, Document, IndexAttemptError, IndexingRun,
    NewIndexAttemptError, NewIndexingRun, RunFailure,
};
use crate::run::RunStatus;

/// Durable store of [`IndexingRun`] records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a `NotStarted` run.
    async fn create_run(&self, new: &NewIndexingRun, now: DateTime<Utc>) -> Result<IndexingRun>;

    async fn get_run(&self, run_id: i64) -> Result<Option<IndexingRun>>;

    /// Runs in `status`, or every run when `None`, oldest first.
    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<IndexingRun>>;

    /// `NotStarted → InProgress` for `worker_id`. Returns false when another
    /// worker got there first or the run is no longer claimable.
    ///
    /// A successful claim also seeds `time_started`, `last_progress_time`
    /// and `last_heartbeat_time` with `now`.
    async fn claim_run(&self, run_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Move the run from `from` to `to` if it is still in `from`.
    ///
    /// `failure` is written when `to` is `Failed`. Returns whether the
    /// transition happened.
    async fn transition(
        &self,
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
        failure: Option<&RunFailure>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Set `cancellation_requested` on a non-terminal run.
    async fn request_cancellation(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Increment `dispatched_batches` if the run is `InProgress` and not
    /// cancelled. Returns the 0-based sequence of the new batch.
    async fn dispatch_batch(&self, run_id: i64, now: DateTime<Utc>) -> Result<Option<i64>>;

    /// Add `stats` to the run counters, bump `completed_batches`, stamp
    /// progress, and clear any stall flag. Returns the updated run.
    async fn complete_batch(
        &self,
        run_id: i64,
        stats: &BatchStats,
        now: DateTime<Utc>,
    ) -> Result<IndexingRun>;

    /// Count one batch-level failure. Returns the new
    /// `total_failures_batch_level`.
    async fn record_batch_failure(&self, run_id: i64, now: DateTime<Utc>) -> Result<i64>;

    /// Set `total_batches` if unset. Returns whether it took effect.
    async fn finalize_total_batches(
        &self,
        run_id: i64,
        total: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Worker heartbeat: increment the counter, stamp the time, return the
    /// new counter value.
    async fn heartbeat(&self, run_id: i64, now: DateTime<Utc>) -> Result<i64>;

    /// Monitor check on an `InProgress` run: if the counter moved since the
    /// last check, record it and reset the miss count, otherwise increment
    /// the miss count. Returns the updated run, or `None` when the run is
    /// not in progress.
    async fn observe_heartbeat(&self, run_id: i64, now: DateTime<Utc>)
        -> Result<Option<IndexingRun>>;

    /// Set `stalled_since = now` on an `InProgress` run not already flagged.
    async fn flag_stalled(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool>;

    async fn set_checkpoint_pointer(
        &self,
        run_id: i64,
        pointer: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

/// Append-only store of [`IndexAttemptError`] rows.
#[async_trait]
pub trait ErrorStore: Send + Sync {
    async fn record_error(&self, error: &NewIndexAttemptError, now: DateTime<Utc>) -> Result<i64>;

    /// Mark one error resolved. Returns false for an unknown id.
    async fn resolve_error(&self, error_id: i64) -> Result<bool>;

    /// Resolve open errors for documents that have since indexed cleanly.
    async fn resolve_errors_for_documents(&self, cc_pair_id: i64, doc_ids: &[String])
        -> Result<u64>;

    async fn list_errors(&self, run_id: i64, unresolved_only: bool)
        -> Result<Vec<IndexAttemptError>>;
}

/// Durable checkpoint blobs, written in batch order.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the checkpoint produced by batch `sequence` of `run`.
    ///
    /// Fails if `sequence` is not greater than the last sequence saved for
    /// the run, so an out-of-order write can never overwrite newer progress.
    async fn save_checkpoint(
        &self,
        run: &IndexingRun,
        sequence: i64,
        checkpoint: &Checkpoint,
        now: DateTime<Utc>,
    ) -> Result<CheckpointRecord>;

    async fn load_checkpoint(&self, pointer: &str) -> Result<Option<CheckpointRecord>>;

    /// Most recently saved checkpoint for `key`, across runs.
    async fn latest_checkpoint(&self, key: CheckpointKey) -> Result<Option<CheckpointRecord>>;
}

/// Destination for indexed documents.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Upsert `docs` for `run`, stamped `now`, and report how many were new
    /// and how many chunks they produced.
    async fn index_documents(
        &self,
        run: &IndexingRun,
        docs: &[Document],
        now: DateTime<Utc>,
    ) -> Result<BatchStats>;

    /// Attach resolved access to documents by id. Returns rows touched.
    async fn upsert_external_access(&self, access: &[DocExternalAccess]) -> Result<u64>;
}
