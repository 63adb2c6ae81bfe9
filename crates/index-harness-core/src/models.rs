//! Core data models for Index Harness.
//!
//! These types describe what flows between connectors, the worker, the
//! monitor, and the durable stores. They are plain data; behaviour that
//! needs a store lives in [`crate::coordinator`] and [`crate::liveness`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureReason;
use crate::run::RunStatus;

/// One execution attempt of pulling documents for a connector-credential
/// pair at a given search configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingRun {
    pub id: i64,
    pub cc_pair_id: i64,
    pub search_settings_id: i64,
    /// Ignore stored checkpoints and start from the connector's dummy one.
    pub from_beginning: bool,

    /// Source-system time window to fetch.
    pub poll_range_start: Option<DateTime<Utc>>,
    pub poll_range_end: Option<DateTime<Utc>>,

    pub status: RunStatus,

    pub new_docs_indexed: i64,
    pub total_docs_indexed: i64,
    pub docs_removed: i64,
    pub total_chunks: i64,

    /// Unknown until the connector reports `has_more = false`.
    pub total_batches: Option<i64>,
    pub dispatched_batches: i64,
    pub completed_batches: i64,
    /// Batches that failed outright on a pull or indexing error. Batches
    /// are not retried: the run fails on the first one, and the count stays
    /// on the record.
    pub total_failures_batch_level: i64,
    pub last_progress_time: Option<DateTime<Utc>>,
    pub last_batches_completed_count: i64,
    /// Set by the monitor when it first sees the run stalled.
    pub stalled_since: Option<DateTime<Utc>>,

    /// Incremented by the active worker only.
    pub heartbeat_counter: i64,
    /// Last counter value a monitor observed.
    pub last_heartbeat_value: i64,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Consecutive monitor checks that saw the counter unchanged.
    pub missed_heartbeat_checks: i64,

    pub worker_id: Option<String>,
    pub cancellation_requested: bool,
    pub checkpoint_pointer: Option<String>,

    // only filled if status = Failed
    pub error_msg: Option<String>,
    pub full_exception_trace: Option<String>,
    pub failure_reason: Option<FailureReason>,

    pub time_created: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_updated: DateTime<Utc>,
}

impl IndexingRun {
    /// A fresh `NotStarted` run built from a [`NewIndexingRun`].
    pub fn from_new(id: i64, new: &NewIndexingRun, now: DateTime<Utc>) -> Self {
        Self {
            id,
            cc_pair_id: new.cc_pair_id,
            search_settings_id: new.search_settings_id,
            from_beginning: new.from_beginning,
            poll_range_start: new.poll_range_start,
            poll_range_end: new.poll_range_end,
            status: RunStatus::NotStarted,
            new_docs_indexed: 0,
            total_docs_indexed: 0,
            docs_removed: 0,
            total_chunks: 0,
            total_batches: None,
            dispatched_batches: 0,
            completed_batches: 0,
            total_failures_batch_level: 0,
            last_progress_time: None,
            last_batches_completed_count: 0,
            stalled_since: None,
            heartbeat_counter: 0,
            last_heartbeat_value: 0,
            last_heartbeat_time: None,
            missed_heartbeat_checks: 0,
            worker_id: None,
            cancellation_requested: false,
            checkpoint_pointer: None,
            error_msg: None,
            full_exception_trace: None,
            failure_reason: None,
            time_created: now,
            time_started: None,
            time_updated: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// True iff the total is known and every batch has completed.
    pub fn is_coordination_complete(&self) -> bool {
        match self.total_batches {
            Some(total) => self.completed_batches >= total,
            None => false,
        }
    }

    /// Key under which this run's checkpoints are stored.
    pub fn checkpoint_key(&self) -> CheckpointKey {
        CheckpointKey {
            cc_pair_id: self.cc_pair_id,
            search_settings_id: self.search_settings_id,
        }
    }
}

/// Parameters the scheduler supplies when creating a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewIndexingRun {
    pub cc_pair_id: i64,
    pub search_settings_id: i64,
    pub from_beginning: bool,
    pub poll_range_start: Option<DateTime<Utc>>,
    pub poll_range_end: Option<DateTime<Utc>>,
}

/// Identifies the checkpoint lineage a run resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub cc_pair_id: i64,
    pub search_settings_id: i64,
}

/// Counters reported when a batch finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub new_docs: i64,
    pub total_docs: i64,
    pub chunks: i64,
    pub docs_removed: i64,
}

/// Terminal outcome details written alongside a `Failed` status.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFailure {
    pub reason: FailureReason,
    pub message: String,
    pub trace: Option<String>,
}

impl RunFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// A per-document or per-range failure recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAttemptError {
    pub id: i64,
    pub run_id: i64,
    pub cc_pair_id: i64,
    pub document_id: Option<String>,
    pub document_link: Option<String>,
    pub entity_id: Option<String>,
    pub failed_time_range_start: Option<DateTime<Utc>>,
    pub failed_time_range_end: Option<DateTime<Utc>>,
    pub failure_message: String,
    pub is_resolved: bool,
    pub time_created: DateTime<Utc>,
}

/// Insert payload for [`IndexAttemptError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIndexAttemptError {
    pub run_id: i64,
    pub cc_pair_id: i64,
    pub document_id: Option<String>,
    pub document_link: Option<String>,
    pub entity_id: Option<String>,
    pub failed_time_range_start: Option<DateTime<Utc>>,
    pub failed_time_range_end: Option<DateTime<Utc>>,
    pub failure_message: String,
}

impl NewIndexAttemptError {
    pub fn from_failure(run: &IndexingRun, failure: &ConnectorFailure) -> Self {
        Self {
            run_id: run.id,
            cc_pair_id: run.cc_pair_id,
            document_id: failure.failed_document.as_ref().map(|d| d.id.clone()),
            document_link: failure
                .failed_document
                .as_ref()
                .and_then(|d| d.link.clone()),
            entity_id: failure.failed_entity.as_ref().map(|e| e.id.clone()),
            failed_time_range_start: failure
                .failed_entity
                .as_ref()
                .and_then(|e| e.missed_time_range.map(|(start, _)| start)),
            failed_time_range_end: failure
                .failed_entity
                .as_ref()
                .and_then(|e| e.missed_time_range.map(|(_, end)| end)),
            failure_message: failure.message.clone(),
        }
    }
}

/// Source-system access descriptor attached to a document.
///
/// When `is_public` is true the email and group sets are informational
/// only and never restrict visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccess {
    pub external_user_emails: BTreeSet<String>,
    pub external_user_group_ids: BTreeSet<String>,
    pub is_public: bool,
}

impl ExternalAccess {
    pub fn public() -> Self {
        Self {
            is_public: true,
            ..Default::default()
        }
    }

    pub fn for_emails<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            external_user_emails: emails.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Query-time check: may a user with `email` and `groups` see the document?
    pub fn is_visible_to(&self, email: &str, groups: &[&str]) -> bool {
        self.is_public
            || self.external_user_emails.contains(email)
            || groups
                .iter()
                .any(|group| self.external_user_group_ids.contains(*group))
    }
}

/// A document produced by a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub semantic_identifier: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Container the document lives in (channel, folder, space).
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub external_access: Option<ExternalAccess>,
}

/// The document a connector failed to fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDocument {
    pub id: String,
    #[serde(default)]
    pub link: Option<String>,
}

/// A non-document entity (channel, page range) a connector failed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEntity {
    pub id: String,
    #[serde(default)]
    pub missed_time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// A recoverable failure yielded inline with documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorFailure {
    #[serde(default)]
    pub failed_document: Option<FailedDocument>,
    #[serde(default)]
    pub failed_entity: Option<FailedEntity>,
    pub message: String,
}

/// Lightweight document listing used by permission sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlimDocument {
    pub id: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub external_access: Option<ExternalAccess>,
}

/// A document id paired with the access resolved for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocExternalAccess {
    pub doc_id: String,
    pub external_access: ExternalAccess,
}
