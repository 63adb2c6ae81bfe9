//! In-memory store for tests and embedding.
//!
//! All state sits behind one `std::sync::Mutex`, which makes every trait
//! method a single atomic step: the same guarantee the SQLite backend gets
//! from single-statement updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointRecord};
use crate::chunk::chunk_document;
use crate::models::{
    BatchStats, CheckpointKey, DocExternalAccess, Document, ExternalAccess, IndexAttemptError,
    IndexingRun, NewIndexAttemptError, NewIndexingRun, RunFailure,
};
use crate::run::RunStatus;

use super::{CheckpointStore, DocumentSink, ErrorStore, RunStore};

const DEFAULT_MAX_TOKENS: usize = 512;

/// A document as the in-memory sink holds it.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub doc: Document,
    pub cc_pair_id: i64,
    pub chunk_count: usize,
    pub external_access: Option<ExternalAccess>,
    pub indexed_at: DateTime<Utc>,
    pub last_indexed_run_id: i64,
}

#[derive(Default)]
struct State {
    runs: BTreeMap<i64, IndexingRun>,
    next_run_id: i64,
    errors: Vec<IndexAttemptError>,
    checkpoints: Vec<CheckpointRecord>,
    documents: HashMap<String, StoredDocument>,
}

/// In-memory implementation of every store trait.
pub struct InMemoryStore {
    state: Mutex<State>,
    max_tokens: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_max_tokens(DEFAULT_MAX_TOKENS)
    }

    /// Store whose sink chunks documents with the given token budget.
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_tokens,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// Snapshot of one indexed document.
    pub fn document(&self, id: &str) -> Option<StoredDocument> {
        self.state().ok()?.documents.get(id).cloned()
    }

    /// Ids of every indexed document, sorted.
    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.state() {
            Ok(state) => state.documents.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }

    /// Every checkpoint saved for `run_id`, in save order.
    pub fn checkpoints_for_run(&self, run_id: i64) -> Vec<CheckpointRecord> {
        match self.state() {
            Ok(state) => state
                .checkpoints
                .iter()
                .filter(|c| c.run_id == run_id)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn run_mut(state: &mut State, run_id: i64) -> Result<&mut IndexingRun> {
    state
        .runs
        .get_mut(&run_id)
        .ok_or_else(|| anyhow!("indexing run {} not found", run_id))
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn create_run(&self, new: &NewIndexingRun, now: DateTime<Utc>) -> Result<IndexingRun> {
        let mut state = self.state()?;
        state.next_run_id += 1;
        let run = IndexingRun::from_new(state.next_run_id, new, now);
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<IndexingRun>> {
        Ok(self.state()?.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<IndexingRun>> {
        Ok(self
            .state()?
            .runs
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn claim_run(&self, run_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        if run.status != RunStatus::NotStarted || run.cancellation_requested {
            return Ok(false);
        }
        run.status = RunStatus::InProgress;
        run.worker_id = Some(worker_id.to_string());
        run.time_started = Some(now);
        run.last_progress_time = Some(now);
        run.last_heartbeat_time = Some(now);
        run.time_updated = now;
        Ok(true)
    }

    async fn transition(
        &self,
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
        failure: Option<&RunFailure>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            bail!("illegal run transition {} -> {}", from, to);
        }
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        if run.status != from {
            return Ok(false);
        }
        run.status = to;
        if to == RunStatus::Failed {
            if let Some(failure) = failure {
                run.error_msg = Some(failure.message.clone());
                run.full_exception_trace = failure.trace.clone();
                run.failure_reason = Some(failure.reason);
            }
        }
        run.time_updated = now;
        Ok(true)
    }

    async fn request_cancellation(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        if run.is_finished() {
            return Ok(false);
        }
        run.cancellation_requested = true;
        run.time_updated = now;
        Ok(true)
    }

    async fn dispatch_batch(&self, run_id: i64, now: DateTime<Utc>) -> Result<Option<i64>> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        if run.status != RunStatus::InProgress || run.cancellation_requested {
            return Ok(None);
        }
        let sequence = run.dispatched_batches;
        run.dispatched_batches += 1;
        run.time_updated = now;
        Ok(Some(sequence))
    }

    async fn complete_batch(
        &self,
        run_id: i64,
        stats: &BatchStats,
        now: DateTime<Utc>,
    ) -> Result<IndexingRun> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        run.completed_batches += 1;
        run.new_docs_indexed += stats.new_docs;
        run.total_docs_indexed += stats.total_docs;
        run.total_chunks += stats.chunks;
        run.docs_removed += stats.docs_removed;
        run.last_progress_time = Some(now);
        run.last_batches_completed_count = run.completed_batches;
        run.stalled_since = None;
        run.time_updated = now;
        Ok(run.clone())
    }

    async fn record_batch_failure(&self, run_id: i64, now: DateTime<Utc>) -> Result<i64> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        run.total_failures_batch_level += 1;
        run.time_updated = now;
        Ok(run.total_failures_batch_level)
    }

    async fn finalize_total_batches(
        &self,
        run_id: i64,
        total: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        if run.total_batches.is_some() {
            return Ok(false);
        }
        run.total_batches = Some(total);
        run.time_updated = now;
        Ok(true)
    }

    async fn heartbeat(&self, run_id: i64, now: DateTime<Utc>) -> Result<i64> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        run.heartbeat_counter += 1;
        run.last_heartbeat_time = Some(now);
        Ok(run.heartbeat_counter)
    }

    async fn observe_heartbeat(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<IndexingRun>> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        if run.status != RunStatus::InProgress {
            return Ok(None);
        }
        if run.heartbeat_counter == run.last_heartbeat_value {
            run.missed_heartbeat_checks += 1;
        } else {
            run.last_heartbeat_value = run.heartbeat_counter;
            run.missed_heartbeat_checks = 0;
        }
        run.time_updated = now;
        Ok(Some(run.clone()))
    }

    async fn flag_stalled(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        if run.status != RunStatus::InProgress || run.stalled_since.is_some() {
            return Ok(false);
        }
        run.stalled_since = Some(now);
        run.time_updated = now;
        Ok(true)
    }

    async fn set_checkpoint_pointer(
        &self,
        run_id: i64,
        pointer: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state()?;
        let run = run_mut(&mut state, run_id)?;
        run.checkpoint_pointer = Some(pointer.to_string());
        run.time_updated = now;
        Ok(())
    }
}

#[async_trait]
impl ErrorStore for InMemoryStore {
    async fn record_error(&self, error: &NewIndexAttemptError, now: DateTime<Utc>) -> Result<i64> {
        let mut state = self.state()?;
        let id = state.errors.len() as i64 + 1;
        state.errors.push(IndexAttemptError {
            id,
            run_id: error.run_id,
            cc_pair_id: error.cc_pair_id,
            document_id: error.document_id.clone(),
            document_link: error.document_link.clone(),
            entity_id: error.entity_id.clone(),
            failed_time_range_start: error.failed_time_range_start,
            failed_time_range_end: error.failed_time_range_end,
            failure_message: error.failure_message.clone(),
            is_resolved: false,
            time_created: now,
        });
        Ok(id)
    }

    async fn resolve_error(&self, error_id: i64) -> Result<bool> {
        let mut state = self.state()?;
        match state.errors.iter_mut().find(|e| e.id == error_id) {
            Some(error) => {
                error.is_resolved = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn resolve_errors_for_documents(
        &self,
        cc_pair_id: i64,
        doc_ids: &[String],
    ) -> Result<u64> {
        let mut state = self.state()?;
        let mut resolved = 0;
        for error in state.errors.iter_mut().filter(|e| {
            !e.is_resolved
                && e.cc_pair_id == cc_pair_id
                && e.document_id.as_ref().map_or(false, |d| doc_ids.contains(d))
        }) {
            error.is_resolved = true;
            resolved += 1;
        }
        Ok(resolved)
    }

    async fn list_errors(
        &self,
        run_id: i64,
        unresolved_only: bool,
    ) -> Result<Vec<IndexAttemptError>> {
        Ok(self
            .state()?
            .errors
            .iter()
            .filter(|e| e.run_id == run_id && !(unresolved_only && e.is_resolved))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn save_checkpoint(
        &self,
        run: &IndexingRun,
        sequence: i64,
        checkpoint: &Checkpoint,
        now: DateTime<Utc>,
    ) -> Result<CheckpointRecord> {
        let blob = checkpoint.to_blob()?;
        let mut state = self.state()?;
        if let Some(last) = state
            .checkpoints
            .iter()
            .filter(|c| c.run_id == run.id)
            .map(|c| c.sequence)
            .max()
        {
            if sequence <= last {
                bail!(
                    "checkpoint for run {} out of order: sequence {} after {}",
                    run.id,
                    sequence,
                    last
                );
            }
        }
        let record = CheckpointRecord {
            pointer: Uuid::new_v4().to_string(),
            key: run.checkpoint_key(),
            run_id: run.id,
            sequence,
            blob,
            created_at: now,
        };
        state.checkpoints.push(record.clone());
        Ok(record)
    }

    async fn load_checkpoint(&self, pointer: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self
            .state()?
            .checkpoints
            .iter()
            .find(|c| c.pointer == pointer)
            .cloned())
    }

    async fn latest_checkpoint(&self, key: CheckpointKey) -> Result<Option<CheckpointRecord>> {
        Ok(self
            .state()?
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.key == key)
            .cloned())
    }
}

#[async_trait]
impl DocumentSink for InMemoryStore {
    async fn index_documents(
        &self,
        run: &IndexingRun,
        docs: &[Document],
        now: DateTime<Utc>,
    ) -> Result<BatchStats> {
        let mut state = self.state()?;
        let mut stats = BatchStats::default();
        for doc in docs {
            let chunk_count = chunk_document(doc, self.max_tokens).len();
            let previous_access = state
                .documents
                .get(&doc.id)
                .and_then(|stored| stored.external_access.clone());
            let previous = state.documents.insert(
                doc.id.clone(),
                StoredDocument {
                    doc: doc.clone(),
                    cc_pair_id: run.cc_pair_id,
                    chunk_count,
                    external_access: doc.external_access.clone().or(previous_access),
                    indexed_at: now,
                    last_indexed_run_id: run.id,
                },
            );
            if previous.is_none() {
                stats.new_docs += 1;
            }
            stats.total_docs += 1;
            stats.chunks += chunk_count as i64;
        }
        Ok(stats)
    }

    async fn upsert_external_access(&self, access: &[DocExternalAccess]) -> Result<u64> {
        let mut state = self.state()?;
        let mut touched = 0;
        for entry in access {
            if let Some(stored) = state.documents.get_mut(&entry.doc_id) {
                stored.external_access = Some(entry.external_access.clone());
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn in_progress_run(store: &InMemoryStore) -> IndexingRun {
        let now = Utc::now();
        let run = store
            .create_run(&NewIndexingRun::default(), now)
            .await
            .unwrap();
        assert!(store.claim_run(run.id, "w1", now).await.unwrap());
        store.get_run(run.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let run = store
            .create_run(&NewIndexingRun::default(), now)
            .await
            .unwrap();
        assert!(store.claim_run(run.id, "w1", now).await.unwrap());
        assert!(!store.claim_run(run.id, "w2", now).await.unwrap());
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.worker_id.as_deref(), Some("w1"));
        assert_eq!(run.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let run = in_progress_run(&store).await;
        let now = Utc::now();
        assert!(store
            .transition(run.id, RunStatus::InProgress, RunStatus::Success, None, now)
            .await
            .unwrap());
        let failure = RunFailure::new(crate::FailureReason::LivenessLost, "late");
        assert!(!store
            .transition(
                run.id,
                RunStatus::InProgress,
                RunStatus::Failed,
                Some(&failure),
                now
            )
            .await
            .unwrap());
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.error_msg.is_none());
    }

    #[tokio::test]
    async fn illegal_transition_is_an_error() {
        let store = InMemoryStore::new();
        let run = in_progress_run(&store).await;
        assert!(store
            .transition(
                run.id,
                RunStatus::Success,
                RunStatus::InProgress,
                None,
                Utc::now()
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn concurrent_completions_lose_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let run = in_progress_run(&store).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let stats = BatchStats {
                    new_docs: 1,
                    total_docs: 2,
                    chunks: 3,
                    docs_removed: 0,
                };
                store.complete_batch(run.id, &stats, Utc::now()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.completed_batches, 32);
        assert_eq!(run.total_docs_indexed, 64);
        assert_eq!(run.total_chunks, 96);
        assert_eq!(run.last_batches_completed_count, 32);
    }

    #[tokio::test]
    async fn checkpoints_must_advance() {
        let store = InMemoryStore::new();
        let run = in_progress_run(&store).await;
        let now = Utc::now();
        let cp = Checkpoint::dummy();
        store.save_checkpoint(&run, 0, &cp, now).await.unwrap();
        store.save_checkpoint(&run, 2, &cp, now).await.unwrap();
        assert!(store.save_checkpoint(&run, 1, &cp, now).await.is_err());
        assert_eq!(store.checkpoints_for_run(run.id).len(), 2);

        let latest = store
            .latest_checkpoint(run.checkpoint_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.sequence, 2);
    }

    #[tokio::test]
    async fn resolving_by_document_only_touches_matching_rows() {
        let store = InMemoryStore::new();
        let run = in_progress_run(&store).await;
        let now = Utc::now();
        for doc in ["a", "b"] {
            store
                .record_error(
                    &NewIndexAttemptError {
                        run_id: run.id,
                        cc_pair_id: run.cc_pair_id,
                        document_id: Some(doc.to_string()),
                        document_link: None,
                        entity_id: None,
                        failed_time_range_start: None,
                        failed_time_range_end: None,
                        failure_message: "timeout".into(),
                    },
                    now,
                )
                .await
                .unwrap();
        }
        let resolved = store
            .resolve_errors_for_documents(run.cc_pair_id, &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved, 1);
        let open = store.list_errors(run.id, true).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].document_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn batch_failures_accumulate_on_the_run() {
        let store = InMemoryStore::new();
        let run = in_progress_run(&store).await;
        assert_eq!(store.record_batch_failure(run.id, Utc::now()).await.unwrap(), 1);
        assert_eq!(store.record_batch_failure(run.id, Utc::now()).await.unwrap(), 2);
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.total_failures_batch_level, 2);
    }

    #[tokio::test]
    async fn indexed_documents_carry_the_supplied_time() {
        let store = InMemoryStore::new();
        let run = in_progress_run(&store).await;
        let at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let doc = Document {
            id: "d1".into(),
            source: "fixture".into(),
            semantic_identifier: "d1".into(),
            link: None,
            body: "hello".into(),
            updated_at: None,
            metadata: Default::default(),
            resource_id: None,
            external_access: None,
        };
        let stats = store.index_documents(&run, &[doc], at).await.unwrap();
        assert_eq!(stats.new_docs, 1);
        let stored = store.document("d1").unwrap();
        assert_eq!(stored.indexed_at, at);
        assert_eq!(stored.last_indexed_run_id, run.id);
    }
}
