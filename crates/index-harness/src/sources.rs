//! Connector registry and `ixh sources`.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            ConnectorRegistry             │
//! │   cc_pair_id ──▶ Box<dyn Connector>      │
//! │  ┌───────────┐      ┌────────────────┐   │
//! │  │ Fixture   │      │ Custom (Rust)  │   │
//! │  └───────────┘      └────────────────┘   │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        run_indexing() / run_perm_sync()
//! ```
//!
//! A run only knows its `cc_pair_id`; the registry is how a worker finds
//! the connector that serves it.

use anyhow::Result;

use index_harness_core::connector::Connector;

use crate::config::Config;
use crate::connector_fixture::FixtureConnector;

struct Registered {
    cc_pair_id: i64,
    connector: Box<dyn Connector>,
}

/// Connectors keyed by the connector-credential pair they index for.
pub struct ConnectorRegistry {
    connectors: Vec<Registered>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Build a registry with every connector configured in `config`.
    ///
    /// Fails if a fixture file cannot be read.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (name, cfg) in &config.connectors.fixture {
            registry.register(
                cfg.cc_pair_id,
                Box::new(FixtureConnector::from_config(name, cfg)?),
            );
        }
        Ok(registry)
    }

    /// Register a connector. A later registration for the same pair wins.
    pub fn register(&mut self, cc_pair_id: i64, connector: Box<dyn Connector>) {
        self.connectors.retain(|r| r.cc_pair_id != cc_pair_id);
        self.connectors.push(Registered {
            cc_pair_id,
            connector,
        });
    }

    /// `(cc_pair_id, connector)` for every registered connector.
    pub fn connectors(&self) -> impl Iterator<Item = (i64, &dyn Connector)> {
        self.connectors
            .iter()
            .map(|r| (r.cc_pair_id, r.connector.as_ref()))
    }

    pub fn find(&self, cc_pair_id: i64) -> Option<&dyn Connector> {
        self.connectors
            .iter()
            .find(|r| r.cc_pair_id == cc_pair_id)
            .map(|r| r.connector.as_ref())
    }

    /// Remove and return the connector for `cc_pair_id`. A worker owns its
    /// connector for the duration of a run.
    pub fn take(&mut self, cc_pair_id: i64) -> Option<Box<dyn Connector>> {
        let index = self
            .connectors
            .iter()
            .position(|r| r.cc_pair_id == cc_pair_id)?;
        Some(self.connectors.remove(index).connector)
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of `ixh sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub label: String,
    pub cc_pair_id: i64,
    pub perm_sync: bool,
    pub healthy: bool,
    pub status: String,
}

/// Status of every configured connector, without loading fixture files.
pub fn get_sources(config: &Config) -> Vec<SourceStatus> {
    config
        .connectors
        .fixture
        .iter()
        .map(|(name, cfg)| {
            let healthy = cfg.path.exists();
            SourceStatus {
                label: format!("fixture:{}", name),
                cc_pair_id: cfg.cc_pair_id,
                perm_sync: cfg.perm_sync,
                healthy,
                status: if healthy {
                    "OK".to_string()
                } else {
                    "MISSING (fixture not found)".to_string()
                },
            }
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let sources = get_sources(config);
    if sources.is_empty() {
        println!("No connectors configured.");
        return Ok(());
    }

    println!(
        "{:<24} {:<8} {:<10} {:<28} HEALTHY",
        "CONNECTOR", "CC_PAIR", "PERM_SYNC", "STATUS"
    );
    for s in &sources {
        println!(
            "{:<24} {:<8} {:<10} {:<28} {}",
            s.label, s.cc_pair_id, s.perm_sync, s.status, s.healthy
        );
    }
    Ok(())
}
