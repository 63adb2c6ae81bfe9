//! Schema migrations.
//!
//! Every statement is `IF NOT EXISTS`, so `ixh init` is idempotent.
//! Timestamps are stored as Unix milliseconds.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_attempt (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cc_pair_id INTEGER NOT NULL,
            search_settings_id INTEGER NOT NULL,
            from_beginning INTEGER NOT NULL DEFAULT 0,
            poll_range_start INTEGER,
            poll_range_end INTEGER,
            status TEXT NOT NULL DEFAULT 'not_started',
            new_docs_indexed INTEGER NOT NULL DEFAULT 0,
            total_docs_indexed INTEGER NOT NULL DEFAULT 0,
            docs_removed INTEGER NOT NULL DEFAULT 0,
            total_chunks INTEGER NOT NULL DEFAULT 0,
            total_batches INTEGER,
            dispatched_batches INTEGER NOT NULL DEFAULT 0,
            completed_batches INTEGER NOT NULL DEFAULT 0,
            total_failures_batch_level INTEGER NOT NULL DEFAULT 0,
            last_progress_time INTEGER,
            last_batches_completed_count INTEGER NOT NULL DEFAULT 0,
            stalled_since INTEGER,
            heartbeat_counter INTEGER NOT NULL DEFAULT 0,
            last_heartbeat_value INTEGER NOT NULL DEFAULT 0,
            last_heartbeat_time INTEGER,
            missed_heartbeat_checks INTEGER NOT NULL DEFAULT 0,
            worker_id TEXT,
            cancellation_requested INTEGER NOT NULL DEFAULT 0,
            checkpoint_pointer TEXT,
            error_msg TEXT,
            full_exception_trace TEXT,
            failure_reason TEXT,
            time_created INTEGER NOT NULL,
            time_started INTEGER,
            time_updated INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_attempt_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            index_attempt_id INTEGER NOT NULL,
            cc_pair_id INTEGER NOT NULL,
            document_id TEXT,
            document_link TEXT,
            entity_id TEXT,
            failed_time_range_start INTEGER,
            failed_time_range_end INTEGER,
            failure_message TEXT NOT NULL,
            is_resolved INTEGER NOT NULL DEFAULT 0,
            time_created INTEGER NOT NULL,
            FOREIGN KEY (index_attempt_id) REFERENCES index_attempt(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            pointer TEXT PRIMARY KEY,
            cc_pair_id INTEGER NOT NULL,
            search_settings_id INTEGER NOT NULL,
            index_attempt_id INTEGER NOT NULL,
            sequence INTEGER NOT NULL,
            blob TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(index_attempt_id, sequence),
            FOREIGN KEY (index_attempt_id) REFERENCES index_attempt(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            cc_pair_id INTEGER NOT NULL,
            source TEXT NOT NULL,
            semantic_identifier TEXT NOT NULL,
            link TEXT,
            body TEXT NOT NULL,
            updated_at INTEGER,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            resource_id TEXT,
            external_access_json TEXT,
            last_indexed_attempt_id INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_attempt_status ON index_attempt(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_key \
         ON checkpoints(cc_pair_id, search_settings_id, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_errors_attempt ON index_attempt_errors(index_attempt_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_errors_document \
         ON index_attempt_errors(cc_pair_id, document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;

    Ok(())
}
