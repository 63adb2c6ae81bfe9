//! Connector checkpoints and ordered checkpoint persistence.
//!
//! A [`Checkpoint`] is an opaque, connector-defined cursor plus a
//! continuation flag. The worker persists each checkpoint before treating
//! the batch that produced it as durable, and it persists them strictly in
//! batch order: a later checkpoint written before an earlier one would let a
//! restart skip a batch that never finished.
//!
//! [`CheckpointSequencer`] enforces that ordering when batches finish out of
//! order on concurrent tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;
use crate::models::CheckpointKey;

/// Opaque connector cursor plus a `has_more` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub has_more: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Checkpoint {
    /// The checkpoint for a first-ever run: more to fetch, no cursor.
    pub fn dummy() -> Self {
        Self {
            has_more: true,
            payload: serde_json::Value::Null,
        }
    }

    /// Wrap a connector's typed cursor.
    pub fn from_typed<T: Serialize>(has_more: bool, cursor: &T) -> anyhow::Result<Self> {
        Ok(Self {
            has_more,
            payload: serde_json::to_value(cursor)?,
        })
    }

    /// Decode the payload back into the connector's cursor type.
    ///
    /// A null payload (dummy checkpoint) decodes to `T::default()`.
    pub fn typed<T: DeserializeOwned + Default>(&self) -> Result<T, ConnectorError> {
        if self.payload.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ConnectorError::MalformedCheckpoint(e.to_string()))
    }

    /// Serialize to the blob stored in a [`crate::store::CheckpointStore`].
    pub fn to_blob(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored blob.
    pub fn from_blob(raw: &str) -> Result<Self, ConnectorError> {
        serde_json::from_str(raw).map_err(|e| ConnectorError::MalformedCheckpoint(e.to_string()))
    }
}

/// A durably stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Opaque reference stored in `IndexingRun::checkpoint_pointer`.
    pub pointer: String,
    pub key: CheckpointKey,
    pub run_id: i64,
    /// Batch sequence number within the run, strictly increasing.
    pub sequence: i64,
    pub blob: String,
    pub created_at: DateTime<Utc>,
}

/// Releases out-of-order completions in strict sequence order.
///
/// Batches are numbered from `0`. Pushing batch `n` returns every item
/// whose sequence is now contiguous with what has already been released,
/// so the caller can persist them one by one.
#[derive(Debug)]
pub struct CheckpointSequencer<T> {
    next: i64,
    waiting: BTreeMap<i64, T>,
}

impl<T> CheckpointSequencer<T> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(next: i64) -> Self {
        Self {
            next,
            waiting: BTreeMap::new(),
        }
    }

    /// Record that `sequence` finished; return everything now releasable.
    ///
    /// Sequences already released are ignored.
    pub fn push(&mut self, sequence: i64, item: T) -> Vec<(i64, T)> {
        if sequence < self.next {
            return Vec::new();
        }
        self.waiting.insert(sequence, item);

        let mut ready = Vec::new();
        while let Some(item) = self.waiting.remove(&self.next) {
            ready.push((self.next, item));
            self.next += 1;
        }
        ready
    }

    /// The sequence that must finish before anything else is released.
    pub fn next_expected(&self) -> i64 {
        self.next
    }

    /// Items finished but blocked behind an earlier sequence.
    pub fn pending(&self) -> usize {
        self.waiting.len()
    }
}

impl<T> Default for CheckpointSequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct PageCursor {
        page: u32,
        last_document_id: Option<String>,
    }

    #[test]
    fn dummy_checkpoint_has_more_and_no_cursor() {
        let cp = Checkpoint::dummy();
        assert!(cp.has_more);
        assert_eq!(cp.typed::<PageCursor>().unwrap(), PageCursor::default());
    }

    #[test]
    fn typed_cursor_survives_blob() {
        let cursor = PageCursor {
            page: 4,
            last_document_id: Some("doc-19".into()),
        };
        let cp = Checkpoint::from_typed(true, &cursor).unwrap();
        let back = Checkpoint::from_blob(&cp.to_blob().unwrap()).unwrap();
        assert_eq!(back, cp);
        assert_eq!(back.typed::<PageCursor>().unwrap(), cursor);
    }

    #[test]
    fn garbage_blob_is_malformed() {
        let err = Checkpoint::from_blob("{not json").unwrap_err();
        assert!(matches!(err, ConnectorError::MalformedCheckpoint(_)));
    }

    #[test]
    fn wrong_payload_shape_is_malformed() {
        let cp = Checkpoint {
            has_more: true,
            payload: serde_json::json!({ "page": "four" }),
        };
        assert!(matches!(
            cp.typed::<PageCursor>(),
            Err(ConnectorError::MalformedCheckpoint(_))
        ));
    }

    #[test]
    fn sequencer_holds_back_until_gap_fills() {
        let mut seq = CheckpointSequencer::new();
        assert!(seq.push(1, "b").is_empty());
        assert!(seq.push(2, "c").is_empty());
        assert_eq!(seq.pending(), 2);

        let ready = seq.push(0, "a");
        assert_eq!(ready, vec![(0, "a"), (1, "b"), (2, "c")]);
        assert_eq!(seq.next_expected(), 3);
        assert_eq!(seq.pending(), 0);
    }

    #[test]
    fn sequencer_ignores_replayed_sequence() {
        let mut seq = CheckpointSequencer::new();
        assert_eq!(seq.push(0, 'x').len(), 1);
        assert!(seq.push(0, 'y').is_empty());
        assert_eq!(seq.next_expected(), 1);
    }
}
