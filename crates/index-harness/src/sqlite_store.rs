//! SQLite-backed implementation of the core store traits.
//!
//! Every run mutation is a single `UPDATE` statement, so SQLite's write lock
//! makes it atomic across connections and processes:
//!
//! | Operation | Statement shape |
//! |-----------|-----------------|
//! | claim / transition | `UPDATE … WHERE id = ? AND status = ?` (compare-and-swap) |
//! | dispatch / complete / heartbeat | `SET x = x + 1 … RETURNING` |
//! | observe heartbeat | `SET missed = CASE WHEN counter = last THEN missed + 1 ELSE 0 END` |
//! | finalize total | `WHERE total_batches IS NULL` |
//! | save checkpoint | `INSERT … SELECT … WHERE NOT EXISTS (newer sequence)` |
//!
//! Nothing is read, modified in Rust, and written back.

use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use index_harness_core::checkpoint::{Checkpoint, CheckpointRecord};
use index_harness_core::chunk::chunk_document;
use index_harness_core::error::FailureReason;
use index_harness_core::models::{
    BatchStats, CheckpointKey, DocExternalAccess, Document, ExternalAccess, IndexAttemptError,
    IndexingRun, NewIndexAttemptError, NewIndexingRun, RunFailure,
};
use index_harness_core::run::RunStatus;
use index_harness_core::store::{CheckpointStore, DocumentSink, ErrorStore, RunStore};

/// SQLite implementation of [`RunStore`], [`ErrorStore`],
/// [`CheckpointStore`], and [`DocumentSink`].
pub struct SqliteStore {
    pool: SqlitePool,
    max_tokens: usize,
}

impl SqliteStore {
    /// `max_tokens` is the chunk budget used when indexing documents.
    pub fn new(pool: SqlitePool, max_tokens: usize) -> Self {
        Self { pool, max_tokens }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stored external access for a document, if the document exists.
    pub async fn document_access(&self, doc_id: &str) -> Result<Option<Option<ExternalAccess>>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT external_access_json FROM documents WHERE id = ?")
                .bind(doc_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Ok(None),
            Some((None,)) => Ok(Some(None)),
            Some((Some(json),)) => Ok(Some(Some(serde_json::from_str(&json)?))),
        }
    }

    /// Number of stored documents for a connector-credential pair.
    pub async fn count_documents(&self, cc_pair_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE cc_pair_id = ?")
            .bind(cc_pair_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn ensure_run_exists(&self, run_id: i64) -> Result<()> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM index_attempt WHERE id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            bail!("indexing run {} not found", run_id);
        }
        Ok(())
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(millis)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn from_opt_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn run_from_row(row: &SqliteRow) -> Result<IndexingRun> {
    let status: String = row.try_get("status")?;
    let failure_reason: Option<String> = row.try_get("failure_reason")?;
    Ok(IndexingRun {
        id: row.try_get("id")?,
        cc_pair_id: row.try_get("cc_pair_id")?,
        search_settings_id: row.try_get("search_settings_id")?,
        from_beginning: row.try_get("from_beginning")?,
        poll_range_start: from_opt_millis(row.try_get("poll_range_start")?)?,
        poll_range_end: from_opt_millis(row.try_get("poll_range_end")?)?,
        status: RunStatus::from_str(&status)?,
        new_docs_indexed: row.try_get("new_docs_indexed")?,
        total_docs_indexed: row.try_get("total_docs_indexed")?,
        docs_removed: row.try_get("docs_removed")?,
        total_chunks: row.try_get("total_chunks")?,
        total_batches: row.try_get("total_batches")?,
        dispatched_batches: row.try_get("dispatched_batches")?,
        completed_batches: row.try_get("completed_batches")?,
        total_failures_batch_level: row.try_get("total_failures_batch_level")?,
        last_progress_time: from_opt_millis(row.try_get("last_progress_time")?)?,
        last_batches_completed_count: row.try_get("last_batches_completed_count")?,
        stalled_since: from_opt_millis(row.try_get("stalled_since")?)?,
        heartbeat_counter: row.try_get("heartbeat_counter")?,
        last_heartbeat_value: row.try_get("last_heartbeat_value")?,
        last_heartbeat_time: from_opt_millis(row.try_get("last_heartbeat_time")?)?,
        missed_heartbeat_checks: row.try_get("missed_heartbeat_checks")?,
        worker_id: row.try_get("worker_id")?,
        cancellation_requested: row.try_get("cancellation_requested")?,
        checkpoint_pointer: row.try_get("checkpoint_pointer")?,
        error_msg: row.try_get("error_msg")?,
        full_exception_trace: row.try_get("full_exception_trace")?,
        failure_reason: failure_reason
            .as_deref()
            .map(FailureReason::from_str)
            .transpose()?,
        time_created: from_millis(row.try_get("time_created")?)?,
        time_started: from_opt_millis(row.try_get("time_started")?)?,
        time_updated: from_millis(row.try_get("time_updated")?)?,
    })
}

fn error_from_row(row: &SqliteRow) -> Result<IndexAttemptError> {
    Ok(IndexAttemptError {
        id: row.try_get("id")?,
        run_id: row.try_get("index_attempt_id")?,
        cc_pair_id: row.try_get("cc_pair_id")?,
        document_id: row.try_get("document_id")?,
        document_link: row.try_get("document_link")?,
        entity_id: row.try_get("entity_id")?,
        failed_time_range_start: from_opt_millis(row.try_get("failed_time_range_start")?)?,
        failed_time_range_end: from_opt_millis(row.try_get("failed_time_range_end")?)?,
        failure_message: row.try_get("failure_message")?,
        is_resolved: row.try_get("is_resolved")?,
        time_created: from_millis(row.try_get("time_created")?)?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<CheckpointRecord> {
    Ok(CheckpointRecord {
        pointer: row.try_get("pointer")?,
        key: CheckpointKey {
            cc_pair_id: row.try_get("cc_pair_id")?,
            search_settings_id: row.try_get("search_settings_id")?,
        },
        run_id: row.try_get("index_attempt_id")?,
        sequence: row.try_get("sequence")?,
        blob: row.try_get("blob")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, new: &NewIndexingRun, now: DateTime<Utc>) -> Result<IndexingRun> {
        let row = sqlx::query(
            r#"
            INSERT INTO index_attempt (cc_pair_id, search_settings_id, from_beginning,
                                       poll_range_start, poll_range_end, status,
                                       time_created, time_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(new.cc_pair_id)
        .bind(new.search_settings_id)
        .bind(new.from_beginning)
        .bind(opt_millis(new.poll_range_start))
        .bind(opt_millis(new.poll_range_end))
        .bind(RunStatus::NotStarted.as_str())
        .bind(millis(now))
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await?;
        run_from_row(&row)
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<IndexingRun>> {
        let row = sqlx::query("SELECT * FROM index_attempt WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<IndexingRun>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM index_attempt WHERE status = ? ORDER BY id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM index_attempt ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(run_from_row).collect()
    }

    async fn claim_run(&self, run_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE index_attempt
            SET status = ?, worker_id = ?, time_started = ?, last_progress_time = ?,
                last_heartbeat_time = ?, time_updated = ?
            WHERE id = ? AND status = ? AND cancellation_requested = 0
            "#,
        )
        .bind(RunStatus::InProgress.as_str())
        .bind(worker_id)
        .bind(millis(now))
        .bind(millis(now))
        .bind(millis(now))
        .bind(millis(now))
        .bind(run_id)
        .bind(RunStatus::NotStarted.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.ensure_run_exists(run_id).await?;
            return Ok(false);
        }
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
        let failure = failure.filter(|_| to == RunStatus::Failed);
        let result = sqlx::query(
            r#"
            UPDATE index_attempt
            SET status = ?,
                error_msg = COALESCE(?, error_msg),
                full_exception_trace = COALESCE(?, full_exception_trace),
                failure_reason = COALESCE(?, failure_reason),
                time_updated = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(failure.map(|f| f.message.as_str()))
        .bind(failure.and_then(|f| f.trace.as_deref()))
        .bind(failure.map(|f| f.reason.as_str()))
        .bind(millis(now))
        .bind(run_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.ensure_run_exists(run_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn request_cancellation(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE index_attempt
            SET cancellation_requested = 1, time_updated = ?
            WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(millis(now))
        .bind(run_id)
        .bind(RunStatus::NotStarted.as_str())
        .bind(RunStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.ensure_run_exists(run_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn dispatch_batch(&self, run_id: i64, now: DateTime<Utc>) -> Result<Option<i64>> {
        let sequence: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE index_attempt
            SET dispatched_batches = dispatched_batches + 1, time_updated = ?
            WHERE id = ? AND status = ? AND cancellation_requested = 0
            RETURNING dispatched_batches - 1
            "#,
        )
        .bind(millis(now))
        .bind(run_id)
        .bind(RunStatus::InProgress.as_str())
        .fetch_optional(&self.pool)
        .await?;
        if sequence.is_none() {
            self.ensure_run_exists(run_id).await?;
        }
        Ok(sequence)
    }

    async fn complete_batch(
        &self,
        run_id: i64,
        stats: &BatchStats,
        now: DateTime<Utc>,
    ) -> Result<IndexingRun> {
        let row = sqlx::query(
            r#"
            UPDATE index_attempt
            SET completed_batches = completed_batches + 1,
                last_batches_completed_count = completed_batches + 1,
                new_docs_indexed = new_docs_indexed + ?,
                total_docs_indexed = total_docs_indexed + ?,
                total_chunks = total_chunks + ?,
                docs_removed = docs_removed + ?,
                last_progress_time = ?,
                stalled_since = NULL,
                time_updated = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(stats.new_docs)
        .bind(stats.total_docs)
        .bind(stats.chunks)
        .bind(stats.docs_removed)
        .bind(millis(now))
        .bind(millis(now))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("indexing run {} not found", run_id))?;
        run_from_row(&row)
    }

    async fn record_batch_failure(&self, run_id: i64, now: DateTime<Utc>) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE index_attempt
            SET total_failures_batch_level = total_failures_batch_level + 1,
                time_updated = ?
            WHERE id = ?
            RETURNING total_failures_batch_level
            "#,
        )
        .bind(millis(now))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        count.ok_or_else(|| anyhow!("indexing run {} not found", run_id))
    }

    async fn finalize_total_batches(
        &self,
        run_id: i64,
        total: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE index_attempt
            SET total_batches = ?, time_updated = ?
            WHERE id = ? AND total_batches IS NULL
            "#,
        )
        .bind(total)
        .bind(millis(now))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.ensure_run_exists(run_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn heartbeat(&self, run_id: i64, now: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            UPDATE index_attempt
            SET heartbeat_counter = heartbeat_counter + 1, last_heartbeat_time = ?
            WHERE id = ?
            RETURNING heartbeat_counter
            "#,
        )
        .bind(millis(now))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("indexing run {} not found", run_id))
    }

    async fn observe_heartbeat(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<IndexingRun>> {
        let row = sqlx::query(
            r#"
            UPDATE index_attempt
            SET missed_heartbeat_checks = CASE
                    WHEN heartbeat_counter = last_heartbeat_value THEN missed_heartbeat_checks + 1
                    ELSE 0
                END,
                last_heartbeat_value = heartbeat_counter,
                time_updated = ?
            WHERE id = ? AND status = ?
            RETURNING *
            "#,
        )
        .bind(millis(now))
        .bind(run_id)
        .bind(RunStatus::InProgress.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn flag_stalled(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE index_attempt
            SET stalled_since = ?, time_updated = ?
            WHERE id = ? AND status = ? AND stalled_since IS NULL
            "#,
        )
        .bind(millis(now))
        .bind(millis(now))
        .bind(run_id)
        .bind(RunStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_checkpoint_pointer(
        &self,
        run_id: i64,
        pointer: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE index_attempt SET checkpoint_pointer = ?, time_updated = ? WHERE id = ?",
        )
        .bind(pointer)
        .bind(millis(now))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("indexing run {} not found", run_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ErrorStore for SqliteStore {
    async fn record_error(&self, error: &NewIndexAttemptError, now: DateTime<Utc>) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO index_attempt_errors (index_attempt_id, cc_pair_id, document_id,
                                              document_link, entity_id,
                                              failed_time_range_start, failed_time_range_end,
                                              failure_message, time_created)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(error.run_id)
        .bind(error.cc_pair_id)
        .bind(&error.document_id)
        .bind(&error.document_link)
        .bind(&error.entity_id)
        .bind(opt_millis(error.failed_time_range_start))
        .bind(opt_millis(error.failed_time_range_end))
        .bind(&error.failure_message)
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn resolve_error(&self, error_id: i64) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM index_attempt_errors WHERE id = ?")
                .bind(error_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Ok(false);
        }
        sqlx::query("UPDATE index_attempt_errors SET is_resolved = 1 WHERE id = ?")
            .bind(error_id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn resolve_errors_for_documents(
        &self,
        cc_pair_id: i64,
        doc_ids: &[String],
    ) -> Result<u64> {
        if doc_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut resolved = 0;
        for doc_id in doc_ids {
            let result = sqlx::query(
                r#"
                UPDATE index_attempt_errors
                SET is_resolved = 1
                WHERE cc_pair_id = ? AND document_id = ? AND is_resolved = 0
                "#,
            )
            .bind(cc_pair_id)
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
            resolved += result.rows_affected();
        }
        tx.commit().await?;
        Ok(resolved)
    }

    async fn list_errors(
        &self,
        run_id: i64,
        unresolved_only: bool,
    ) -> Result<Vec<IndexAttemptError>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM index_attempt_errors
            WHERE index_attempt_id = ? AND (? = 0 OR is_resolved = 0)
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .bind(unresolved_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(error_from_row).collect()
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn save_checkpoint(
        &self,
        run: &IndexingRun,
        sequence: i64,
        checkpoint: &Checkpoint,
        now: DateTime<Utc>,
    ) -> Result<CheckpointRecord> {
        let record = CheckpointRecord {
            pointer: Uuid::new_v4().to_string(),
            key: run.checkpoint_key(),
            run_id: run.id,
            sequence,
            blob: checkpoint.to_blob()?,
            created_at: now,
        };
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (pointer, cc_pair_id, search_settings_id,
                                     index_attempt_id, sequence, blob, created_at)
            SELECT ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM checkpoints WHERE index_attempt_id = ? AND sequence >= ?
            )
            "#,
        )
        .bind(&record.pointer)
        .bind(record.key.cc_pair_id)
        .bind(record.key.search_settings_id)
        .bind(record.run_id)
        .bind(record.sequence)
        .bind(&record.blob)
        .bind(millis(now))
        .bind(record.run_id)
        .bind(record.sequence)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!(
                "checkpoint for run {} out of order: sequence {} is not newer than the last saved",
                run.id,
                sequence
            );
        }
        Ok(record)
    }

    async fn load_checkpoint(&self, pointer: &str) -> Result<Option<CheckpointRecord>> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE pointer = ?")
            .bind(pointer)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn latest_checkpoint(&self, key: CheckpointKey) -> Result<Option<CheckpointRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM checkpoints
            WHERE cc_pair_id = ? AND search_settings_id = ?
            ORDER BY rowid DESC
            LIMIT 1
            "#,
        )
        .bind(key.cc_pair_id)
        .bind(key.search_settings_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }
}

#[async_trait]
impl DocumentSink for SqliteStore {
    async fn index_documents(
        &self,
        run: &IndexingRun,
        docs: &[Document],
        now: DateTime<Utc>,
    ) -> Result<BatchStats> {
        let mut stats = BatchStats::default();
        // The first statement must be a write. A deferred transaction that
        // reads first gets SQLITE_BUSY on the lock upgrade without waiting.
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            let metadata_json = serde_json::to_string(&doc.metadata)?;
            let access_json = doc
                .external_access
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO documents (id, cc_pair_id, source, semantic_identifier, link, body,
                                       updated_at, metadata_json, resource_id,
                                       external_access_json, last_indexed_attempt_id, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&doc.id)
            .bind(run.cc_pair_id)
            .bind(&doc.source)
            .bind(&doc.semantic_identifier)
            .bind(&doc.link)
            .bind(&doc.body)
            .bind(opt_millis(doc.updated_at))
            .bind(&metadata_json)
            .bind(&doc.resource_id)
            .bind(&access_json)
            .bind(run.id)
            .bind(millis(now))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert document {}", doc.id))?
            .rows_affected()
                == 1;

            if !inserted {
                sqlx::query(
                    r#"
                    UPDATE documents
                    SET cc_pair_id = ?,
                        source = ?,
                        semantic_identifier = ?,
                        link = ?,
                        body = ?,
                        updated_at = ?,
                        metadata_json = ?,
                        resource_id = ?,
                        external_access_json = COALESCE(?, external_access_json),
                        last_indexed_attempt_id = ?,
                        indexed_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(run.cc_pair_id)
                .bind(&doc.source)
                .bind(&doc.semantic_identifier)
                .bind(&doc.link)
                .bind(&doc.body)
                .bind(opt_millis(doc.updated_at))
                .bind(&metadata_json)
                .bind(&doc.resource_id)
                .bind(&access_json)
                .bind(run.id)
                .bind(millis(now))
                .bind(&doc.id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to update document {}", doc.id))?;
            }

            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(&doc.id)
                .execute(&mut *tx)
                .await?;

            let chunks = chunk_document(doc, self.max_tokens);
            for chunk in &chunks {
                sqlx::query(
                    "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(chunk.chunk_index)
                .bind(&chunk.text)
                .bind(&chunk.hash)
                .execute(&mut *tx)
                .await?;
            }

            if inserted {
                stats.new_docs += 1;
            }
            stats.total_docs += 1;
            stats.chunks += chunks.len() as i64;
        }

        tx.commit().await?;
        Ok(stats)
    }

    async fn upsert_external_access(&self, access: &[DocExternalAccess]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut touched = 0;
        for entry in access {
            let json = serde_json::to_string(&entry.external_access)?;
            let result = sqlx::query("UPDATE documents SET external_access_json = ? WHERE id = ?")
                .bind(&json)
                .bind(&entry.doc_id)
                .execute(&mut *tx)
                .await?;
            touched += result.rows_affected();
        }
        tx.commit().await?;
        Ok(touched)
    }
}
