//! The connector capability contract.
//!
//! Every source (Slack, Drive, a fixture file) implements [`Connector`].
//! The worker never branches on source type: it only calls the methods
//! below, in this order:
//!
//! 1. [`load_credentials`](Connector::load_credentials)
//! 2. [`build_dummy_checkpoint`](Connector::build_dummy_checkpoint) or
//!    [`validate_checkpoint`](Connector::validate_checkpoint) on resume
//! 3. [`load_from_checkpoint`](Connector::load_from_checkpoint) in a loop,
//!    feeding back the returned checkpoint until `has_more` is false
//!
//! Permission sync uses
//! [`retrieve_all_slim_documents`](Connector::retrieve_all_slim_documents)
//! instead, and perm-sync indexing uses
//! [`load_from_checkpoint_with_perm_sync`](Connector::load_from_checkpoint_with_perm_sync).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::Checkpoint;
use crate::error::ConnectorError;
use crate::models::{ConnectorFailure, Document, SlimDocument};

/// Secrets handed to a connector. Shape is connector-defined.
pub type Credentials = serde_json::Map<String, serde_json::Value>;

/// One item yielded by a checkpointed pull.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorOutput {
    Document(Document),
    Failure(ConnectorFailure),
}

/// Everything one call to a checkpointed pull produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointOutput {
    /// Items in the order the connector yielded them.
    pub items: Vec<ConnectorOutput>,
    /// Checkpoint to pass to the next call.
    pub checkpoint: Checkpoint,
}

impl CheckpointOutput {
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.items.iter().filter_map(|item| match item {
            ConnectorOutput::Document(doc) => Some(doc),
            ConnectorOutput::Failure(_) => None,
        })
    }
}

/// Stop signal and progress sink handed to long-running connector calls.
#[async_trait]
pub trait IndexingCallback: Send + Sync {
    /// Whether the caller wants the operation to stop at the next boundary.
    async fn should_stop(&self) -> bool;

    /// Report that `amount` units of work finished under `tag`.
    async fn progress(&self, tag: &str, amount: u64);
}

/// A callback that never stops and discards progress.
pub struct NoopCallback;

#[async_trait]
impl IndexingCallback for NoopCallback {
    async fn should_stop(&self) -> bool {
        false
    }

    async fn progress(&self, _tag: &str, _amount: u64) {}
}

/// A source of documents that can be pulled in resumable batches.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use chrono::{DateTime, Utc};
/// use index_harness_core::checkpoint::Checkpoint;
/// use index_harness_core::connector::{CheckpointOutput, Connector, Credentials};
/// use index_harness_core::error::ConnectorError;
///
/// struct Empty;
///
/// #[async_trait]
/// impl Connector for Empty {
///     fn name(&self) -> &str { "empty" }
///     fn description(&self) -> &str { "Yields nothing" }
///
///     async fn load_credentials(
///         &mut self,
///         _credentials: &Credentials,
///     ) -> Result<Option<Credentials>, ConnectorError> {
///         Ok(None)
///     }
///
///     async fn load_from_checkpoint(
///         &self,
///         _start: DateTime<Utc>,
///         _end: DateTime<Utc>,
///         _checkpoint: &Checkpoint,
///     ) -> Result<CheckpointOutput, ConnectorError> {
///         Ok(CheckpointOutput {
///             items: vec![],
///             checkpoint: Checkpoint { has_more: false, payload: serde_json::Value::Null },
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Instance name (e.g. `"eng-slack"`).
    fn name(&self) -> &str;

    /// One-line description for `ixh sources`.
    fn description(&self) -> &str;

    /// Connector type identifier (e.g. `"slack"`, `"fixture"`).
    fn connector_type(&self) -> &str {
        "custom"
    }

    /// Label used to tag documents: `"{type}:{name}"`.
    fn source_label(&self) -> String {
        format!("{}:{}", self.connector_type(), self.name())
    }

    /// Validate and load secrets, returning refreshed secrets if the
    /// connector rotated them. Fails with [`ConnectorError::Auth`].
    async fn load_credentials(
        &mut self,
        credentials: &Credentials,
    ) -> Result<Option<Credentials>, ConnectorError>;

    /// Checkpoint for a first-ever run.
    fn build_dummy_checkpoint(&self) -> Checkpoint {
        Checkpoint::dummy()
    }

    /// Parse a persisted checkpoint blob.
    ///
    /// Connectors with a typed cursor should override this to also check
    /// the payload shape.
    fn validate_checkpoint(&self, raw: &str) -> Result<Checkpoint, ConnectorError> {
        Checkpoint::from_blob(raw)
    }

    /// Pull one bounded batch starting at `checkpoint`.
    async fn load_from_checkpoint(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        checkpoint: &Checkpoint,
    ) -> Result<CheckpointOutput, ConnectorError>;

    /// Whether [`load_from_checkpoint_with_perm_sync`](Connector::load_from_checkpoint_with_perm_sync)
    /// is implemented.
    fn supports_perm_sync(&self) -> bool {
        false
    }

    /// Same as [`load_from_checkpoint`](Connector::load_from_checkpoint) but
    /// every yielded document must carry `external_access`.
    async fn load_from_checkpoint_with_perm_sync(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _checkpoint: &Checkpoint,
    ) -> Result<CheckpointOutput, ConnectorError> {
        Err(ConnectorError::Unsupported {
            connector: self.source_label(),
            capability: "permission sync",
        })
    }

    /// List every document id the source currently holds, in batches.
    async fn retrieve_all_slim_documents(
        &self,
        _callback: &dyn IndexingCallback,
    ) -> Result<Vec<Vec<SlimDocument>>, ConnectorError> {
        Err(ConnectorError::Unsupported {
            connector: self.source_label(),
            capability: "slim document listing",
        })
    }
}
