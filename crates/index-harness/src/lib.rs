//! # Index Harness
//!
//! **Resumable connector indexing backed by SQLite.**
//!
//! Index Harness pulls documents from connectors in checkpointed batches,
//! indexes them, and coordinates the run record shared by workers and
//! monitors. Runs survive worker crashes (they resume from the last durable
//! checkpoint), cancellation (in-flight batches drain first), and silent
//! worker death (a reconciler notices the frozen heartbeat and fails the
//! run).
//!
//! The run state machine, checkpoint sequencing, batch coordination,
//! liveness policy, and permission sync live in
//! [`index_harness_core`]; this crate supplies the SQLite backend, the
//! worker runtime, and the `ixh` CLI.
//!
//! ## Architecture
//!
//! ```text
//!  ixh run create ──▶ index_attempt (not_started)
//!                          │
//!  ixh run work ──▶ claim ─┴─▶ heartbeat task ─┐
//!                     │                        │ heartbeat_counter++
//!                     ▼                        ▼
//!              connector pulls ──▶ batches ──▶ SQLite (WAL)
//!                                                 ▲
//!  ixh reconcile ──▶ LivenessMonitor::sweep ──────┘ stall / dead checks
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Idempotent schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core store traits |
//! | [`worker`] | Claim, pull, index, checkpoint, finalize |
//! | [`heartbeat`] | Background heartbeat task |
//! | [`reconcile`] | Monitor loop for stalled and dead runs |
//! | [`connector_fixture`] | JSON fixture connector and identity directory |
//! | [`sources`] | Connector registry and `ixh sources` |
//! | [`runs`] | `ixh run` / `ixh errors` commands |
//! | [`perm_sync_cmd`] | `ixh perm-sync` |
//! | [`progress`] | Progress reporting on stderr |
//! | [`observability`] | `tracing` subscriber setup |

pub mod config;
pub mod connector_fixture;
pub mod db;
pub mod heartbeat;
pub mod migrate;
pub mod observability;
pub mod perm_sync_cmd;
pub mod progress;
pub mod reconcile;
pub mod runs;
pub mod sources;
pub mod sqlite_store;
pub mod worker;

pub use index_harness_core;
