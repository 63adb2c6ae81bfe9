//! SQLite database connection management.
//!
//! Every worker, monitor, and CLI command talks to the run table through
//! this pool. WAL mode lets the heartbeat task, batch completions, and a
//! concurrently running `ixh reconcile` read and write without blocking
//! each other; the busy timeout absorbs the brief writer contention that
//! remains.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a connection pool to the configured SQLite database.
///
/// Creates the database file and parent directories if they don't exist.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
