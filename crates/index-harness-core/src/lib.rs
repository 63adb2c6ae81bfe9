//! # Index Harness Core
//!
//! Runtime-agnostic logic for resumable connector indexing: the indexing
//! run state machine, checkpoints and their ordered persistence, batch
//! coordination, heartbeat/stall evaluation, and permission sync.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Storage is
//! reached only through the traits in [`store`]; an in-memory backend
//! ships in [`store::memory`] for tests and embedding.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Run records, attempt errors, documents, external access |
//! | [`run`] | Run status state machine |
//! | [`checkpoint`] | Opaque checkpoints and the ordered-persistence sequencer |
//! | [`connector`] | The `Connector` capability trait |
//! | [`error`] | Connector error taxonomy and run failure reasons |
//! | [`store`] | `RunStore`, `ErrorStore`, `CheckpointStore`, `DocumentSink` |
//! | [`coordinator`] | Batch dispatch / completion / finalization |
//! | [`liveness`] | Heartbeat and stall reconciliation sweeps |
//! | [`perm_sync`] | External access resolution for permission sync |
//! | [`chunk`] | Token-budgeted document chunker |
//! | [`clock`] | Injectable time source |

pub mod checkpoint;
pub mod chunk;
pub mod clock;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod liveness;
pub mod models;
pub mod perm_sync;
pub mod run;
pub mod store;

pub use checkpoint::Checkpoint;
pub use connector::Connector;
pub use error::{ConnectorError, FailureReason};
pub use models::{ExternalAccess, IndexingRun};
pub use run::RunStatus;
