//! `ixh perm-sync <connector>`: resolve and store document access.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use index_harness_core::connector::IndexingCallback;
use index_harness_core::perm_sync::sync_document_access;
use index_harness_core::store::DocumentSink;

use crate::config::Config;
use crate::connector_fixture::{FixtureConnector, FixtureIdentityResolver};
use crate::db;
use crate::runs::find_connector_config;
use crate::sqlite_store::SqliteStore;

/// Stops at the next batch boundary once Ctrl-C is pressed.
struct InterruptCallback {
    interrupted: Arc<AtomicBool>,
}

#[async_trait]
impl IndexingCallback for InterruptCallback {
    async fn should_stop(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    async fn progress(&self, tag: &str, amount: u64) {
        tracing::debug!(tag, amount, "perm-sync progress");
    }
}

pub async fn run_perm_sync(config: &Config, connector: &str) -> Result<()> {
    let (name, cfg) = find_connector_config(config, connector)?;
    let resolver_path = cfg.resolver_path.as_ref().ok_or_else(|| {
        anyhow!(
            "connectors.fixture.{} has no resolver_path; permission sync needs an identity directory",
            name
        )
    })?;
    let connector = FixtureConnector::from_config(name, cfg)?;
    let resolver = FixtureIdentityResolver::from_path(resolver_path)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });
    let callback = InterruptCallback { interrupted };

    let access = sync_document_access(&connector, &resolver, &callback).await?;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool, config.chunking.max_tokens);
    let updated = store.upsert_external_access(&access).await?;
    let public = access
        .iter()
        .filter(|a| a.external_access.is_public)
        .count();

    println!("perm-sync fixture:{}", name);
    println!("  documents resolved: {}", access.len());
    println!("  public: {}", public);
    println!("  documents updated: {}", updated);
    println!("ok");
    Ok(())
}
