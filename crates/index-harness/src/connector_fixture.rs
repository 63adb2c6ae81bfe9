//! JSON fixture connector.
//!
//! Replays a fixed sequence of pages from a JSON file through the
//! checkpointed connector contract. It is the connector the CLI and the
//! integration tests drive; it exercises every path the worker has to
//! handle: per-document failures, mid-run crashes, auth errors, and
//! perm-sync loads.
//!
//! # File format
//!
//! ```json
//! {
//!   "reject_credentials": false,
//!   "fill_missing_access": true,
//!   "slim_batch_size": 100,
//!   "pages": [
//!     { "items": [ { "document": { "id": "d1", "source": "fixture",
//!                                  "semantic_identifier": "Doc 1", "body": "…" } },
//!                  { "failure": { "failed_document": { "id": "d2" },
//!                                 "message": "rate limited" } } ] },
//!     { "items": [], "unhandled_exception": "connection reset" }
//!   ]
//! }
//! ```
//!
//! The cursor is `{ "page": n }`; each call serves exactly one page.
//!
//! An identity directory for `ixh perm-sync` lives in a separate file and
//! is served by [`FixtureIdentityResolver`].

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use index_harness_core::checkpoint::Checkpoint;
use index_harness_core::connector::{
    CheckpointOutput, Connector, ConnectorOutput, Credentials, IndexingCallback,
};
use index_harness_core::error::ConnectorError;
use index_harness_core::models::{ConnectorFailure, Document, ExternalAccess, SlimDocument};
use index_harness_core::perm_sync::{IdentityResolver, ResourceInfo, ResourceVisibility};

use crate::config::FixtureConnectorConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureItem {
    Document(Document),
    Failure(ConnectorFailure),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixturePage {
    #[serde(default)]
    pub items: Vec<FixtureItem>,
    /// Fail the call after nothing is yielded, as a crashing connector would.
    #[serde(default)]
    pub unhandled_exception: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub reject_credentials: bool,
    /// In perm-sync mode, give documents without access a mock one.
    #[serde(default = "default_fill_missing_access")]
    pub fill_missing_access: bool,
    #[serde(default = "default_slim_batch_size")]
    pub slim_batch_size: usize,
    pub pages: Vec<FixturePage>,
}

fn default_fill_missing_access() -> bool {
    true
}

fn default_slim_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureCursor {
    pub page: usize,
}

/// Access given to perm-sync documents the fixture left without one.
pub fn mock_external_access() -> ExternalAccess {
    ExternalAccess {
        external_user_emails: ["test@example.com", "admin@example.com"]
            .into_iter()
            .map(String::from)
            .collect(),
        external_user_group_ids: ["mock-group-1", "mock-group-2"]
            .into_iter()
            .map(String::from)
            .collect(),
        is_public: false,
    }
}

pub struct FixtureConnector {
    name: String,
    description: String,
    perm_sync: bool,
    fixture: FixtureFile,
}

impl FixtureConnector {
    pub fn new(name: impl Into<String>, fixture: FixtureFile, perm_sync: bool) -> Self {
        let fixture_pages = fixture.pages.len();
        Self {
            name: name.into(),
            description: format!("Replays {} page(s) from a JSON fixture", fixture_pages),
            perm_sync,
            fixture,
        }
    }

    /// Build a connector from its `[connectors.fixture.<name>]` entry.
    pub fn from_config(name: &str, config: &FixtureConnectorConfig) -> Result<Self> {
        let fixture = load_fixture(&config.path)?;
        Ok(Self::new(name, fixture, config.perm_sync))
    }

    fn page(&self, checkpoint: &Checkpoint) -> Result<(usize, Option<&FixturePage>), ConnectorError> {
        let cursor: FixtureCursor = checkpoint.typed()?;
        Ok((cursor.page, self.fixture.pages.get(cursor.page)))
    }

    fn serve(&self, checkpoint: &Checkpoint, perm_sync: bool) -> Result<CheckpointOutput, ConnectorError> {
        let (index, page) = self.page(checkpoint)?;
        let page = match page {
            Some(page) => page,
            None => {
                return Ok(CheckpointOutput {
                    items: Vec::new(),
                    checkpoint: Checkpoint::from_typed(false, &FixtureCursor { page: index })?,
                })
            }
        };

        if let Some(message) = &page.unhandled_exception {
            return Err(ConnectorError::Other(anyhow::anyhow!(
                "{} (page {})",
                message,
                index
            )));
        }

        let items = page
            .items
            .iter()
            .map(|item| match item {
                FixtureItem::Document(doc) => {
                    let mut doc = doc.clone();
                    if perm_sync && doc.external_access.is_none() && self.fixture.fill_missing_access
                    {
                        doc.external_access = Some(mock_external_access());
                    }
                    ConnectorOutput::Document(doc)
                }
                FixtureItem::Failure(failure) => ConnectorOutput::Failure(failure.clone()),
            })
            .collect();

        let next = index + 1;
        debug!(connector = %self.name, page = index, "served fixture page");
        Ok(CheckpointOutput {
            items,
            checkpoint: Checkpoint::from_typed(
                next < self.fixture.pages.len(),
                &FixtureCursor { page: next },
            )?,
        })
    }
}

/// Parse a fixture file.
pub fn load_fixture(path: &Path) -> Result<FixtureFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixture: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse fixture: {}", path.display()))
}

#[async_trait]
impl Connector for FixtureConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn connector_type(&self) -> &str {
        "fixture"
    }

    async fn load_credentials(
        &mut self,
        _credentials: &Credentials,
    ) -> Result<Option<Credentials>, ConnectorError> {
        if self.fixture.reject_credentials {
            return Err(ConnectorError::Auth(format!(
                "credentials rejected for {}",
                self.source_label()
            )));
        }
        Ok(None)
    }

    fn validate_checkpoint(&self, raw: &str) -> Result<Checkpoint, ConnectorError> {
        let checkpoint = Checkpoint::from_blob(raw)?;
        checkpoint.typed::<FixtureCursor>()?;
        Ok(checkpoint)
    }

    async fn load_from_checkpoint(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        checkpoint: &Checkpoint,
    ) -> Result<CheckpointOutput, ConnectorError> {
        self.serve(checkpoint, false)
    }

    fn supports_perm_sync(&self) -> bool {
        self.perm_sync
    }

    async fn load_from_checkpoint_with_perm_sync(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        checkpoint: &Checkpoint,
    ) -> Result<CheckpointOutput, ConnectorError> {
        if !self.perm_sync {
            return Err(ConnectorError::Unsupported {
                connector: self.source_label(),
                capability: "permission sync",
            });
        }
        self.serve(checkpoint, true)
    }

    async fn retrieve_all_slim_documents(
        &self,
        callback: &dyn IndexingCallback,
    ) -> Result<Vec<Vec<SlimDocument>>, ConnectorError> {
        let slim: Vec<SlimDocument> = self
            .fixture
            .pages
            .iter()
            .flat_map(|page| page.items.iter())
            .filter_map(|item| match item {
                FixtureItem::Document(doc) => Some(SlimDocument {
                    id: doc.id.clone(),
                    resource_id: doc.resource_id.clone(),
                    external_access: doc.external_access.clone(),
                }),
                FixtureItem::Failure(_) => None,
            })
            .collect();

        let mut batches = Vec::new();
        for batch in slim.chunks(self.fixture.slim_batch_size.max(1)) {
            if callback.should_stop().await {
                return Err(ConnectorError::Stopped(format!(
                    "slim listing for {}",
                    self.source_label()
                )));
            }
            batches.push(batch.to_vec());
        }
        Ok(batches)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Identity directory
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureResource {
    pub id: String,
    pub visibility: ResourceVisibility,
    /// Omitted when membership cannot be enumerated.
    #[serde(default)]
    pub members: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixtureDirectory {
    /// Workspace users: user id → email.
    #[serde(default)]
    pub users: HashMap<String, String>,
    #[serde(default)]
    pub resources: Vec<FixtureResource>,
    /// Users outside the directory reachable by individual lookup. A `null`
    /// email means the user exists but has none.
    #[serde(default)]
    pub lookup: HashMap<String, Option<String>>,
    #[serde(default)]
    pub source_is_public: bool,
}

/// [`IdentityResolver`] backed by a JSON directory file.
pub struct FixtureIdentityResolver {
    directory: FixtureDirectory,
}

impl FixtureIdentityResolver {
    pub fn new(directory: FixtureDirectory) -> Self {
        Self { directory }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity directory: {}", path.display()))?;
        let directory = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse identity directory: {}", path.display()))?;
        Ok(Self::new(directory))
    }
}

#[async_trait]
impl IdentityResolver for FixtureIdentityResolver {
    async fn list_user_emails(&self) -> Result<HashMap<String, String>> {
        Ok(self.directory.users.clone())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        Ok(self
            .directory
            .resources
            .iter()
            .map(|r| ResourceInfo {
                id: r.id.clone(),
                visibility: r.visibility,
            })
            .collect())
    }

    async fn resource_members(&self, resource_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .directory
            .resources
            .iter()
            .find(|r| r.id == resource_id)
            .and_then(|r| r.members.clone()))
    }

    async fn lookup_user_email(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.directory.lookup.get(user_id).cloned().flatten())
    }

    fn source_is_public(&self) -> bool {
        self.directory.source_is_public
    }
}
