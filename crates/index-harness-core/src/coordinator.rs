//! Batch coordination for one indexing run.
//!
//! The coordinator owns the batch counters on the run record. It holds no
//! state of its own: every call is a single atomic operation on the
//! [`RunStore`], so any number of tasks (or processes) can dispatch and
//! complete batches for the same run.
//!
//! ```text
//! dispatch_batch ──▶ (connector pull + indexing) ──▶ mark_batch_complete
//!                                                       │
//!                 has_more = false observed ──▶ finalize_total_batches
//!                                                       │
//!                        completed_batches ≥ total_batches ⇒ complete
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::clock::Clock;
use crate::models::{BatchStats, IndexingRun};
use crate::store::RunStore;

/// A dispatched batch of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHandle {
    pub run_id: i64,
    /// 0-based dispatch order within the run.
    pub sequence: i64,
}

pub struct BatchCoordinator {
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
}

impl BatchCoordinator {
    pub fn new(store: Arc<dyn RunStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Reserve the next batch of `run_id`.
    ///
    /// Returns `None` when the run is not `InProgress` or cancellation has
    /// been requested; the caller must stop dispatching.
    pub async fn dispatch_batch(&self, run_id: i64) -> Result<Option<BatchHandle>> {
        let sequence = self.store.dispatch_batch(run_id, self.clock.now()).await?;
        Ok(sequence.map(|sequence| BatchHandle { run_id, sequence }))
    }

    /// Record a finished batch and its document/chunk counts.
    pub async fn mark_batch_complete(
        &self,
        handle: &BatchHandle,
        stats: &BatchStats,
    ) -> Result<IndexingRun> {
        let run = self
            .store
            .complete_batch(handle.run_id, stats, self.clock.now())
            .await?;
        debug!(
            run_id = run.id,
            batch = handle.sequence,
            completed = run.completed_batches,
            docs = stats.total_docs,
            "batch complete"
        );
        Ok(run)
    }

    /// Fix the run's batch total. Idempotent: once set, later calls leave
    /// it unchanged and return `false`.
    pub async fn finalize_total_batches(&self, run_id: i64, total: i64) -> Result<bool> {
        let applied = self
            .store
            .finalize_total_batches(run_id, total, self.clock.now())
            .await?;
        if applied {
            debug!(run_id, total, "total batches finalized");
        }
        Ok(applied)
    }

    pub async fn is_coordination_complete(&self, run_id: i64) -> Result<bool> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("indexing run {} not found", run_id))?;
        Ok(run.is_coordination_complete())
    }
}
