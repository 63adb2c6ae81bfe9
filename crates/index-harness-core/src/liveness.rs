//! Heartbeat and stall reconciliation.
//!
//! Two independent signals decide whether an `InProgress` run is healthy:
//!
//! | Signal | Written by | Failure mode |
//! |--------|------------|--------------|
//! | `heartbeat_counter` | worker's heartbeat task | **dead**: counter frozen for `dead_after_missed_checks` consecutive checks |
//! | `last_progress_time` | batch completion | **stalled**: no batch finished within `stall_threshold`, then `stall_grace` more |
//!
//! A dead worker fails the run on the spot. A stalled-but-alive worker is
//! only flagged at first and fails once the grace window passes without a
//! batch completing, so one slow batch does not kill the run.
//!
//! [`LivenessMonitor::sweep`] is what a reconciliation process calls on
//! every monitor interval.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::FailureReason;
use crate::models::{IndexingRun, RunFailure};
use crate::run::RunStatus;
use crate::store::RunStore;

/// Thresholds for the monitor. All operationally tuned.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub stall_threshold: Duration,
    pub stall_grace: Duration,
    pub dead_after_missed_checks: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stall_threshold: Duration::minutes(30),
            stall_grace: Duration::minutes(60),
            dead_after_missed_checks: 2,
        }
    }
}

/// Progress state of a run at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallState {
    Progressing,
    /// Past the threshold and not yet flagged.
    NewlyStalled,
    /// Flagged at `since`.
    Stalled { since: DateTime<Utc> },
}

/// Classify `run`'s batch progress at `now`.
pub fn evaluate_stall(run: &IndexingRun, now: DateTime<Utc>, config: &MonitorConfig) -> StallState {
    let last_progress = run
        .last_progress_time
        .or(run.time_started)
        .unwrap_or(run.time_created);
    let idle = now - last_progress;
    let no_new_batches = run.completed_batches == run.last_batches_completed_count;

    if idle <= config.stall_threshold || !no_new_batches {
        return StallState::Progressing;
    }
    match run.stalled_since {
        Some(since) => StallState::Stalled { since },
        None => StallState::NewlyStalled,
    }
}

/// What one check did to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Healthy,
    /// Flagged or still flagged as stalled, inside the grace window.
    Stalled,
    FailedStalled,
    FailedDead,
    /// Run was not in progress, or another actor finished it first.
    Skipped,
}

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub stalled: usize,
    pub failed_stalled: usize,
    pub failed_dead: usize,
    /// Runs whose check hit a store error. They are retried next sweep.
    pub errors: usize,
}

pub struct LivenessMonitor {
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
}

impl LivenessMonitor {
    pub fn new(store: Arc<dyn RunStore>, clock: Arc<dyn Clock>, config: MonitorConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Check every `InProgress` run once.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let runs = self.store.list_runs(Some(RunStatus::InProgress)).await?;
        let mut report = SweepReport::default();
        for run in runs {
            report.checked += 1;
            match self.check_run(run.id).await {
                Ok(CheckOutcome::Healthy) => report.healthy += 1,
                Ok(CheckOutcome::Stalled) => report.stalled += 1,
                Ok(CheckOutcome::FailedStalled) => report.failed_stalled += 1,
                Ok(CheckOutcome::FailedDead) => report.failed_dead += 1,
                Ok(CheckOutcome::Skipped) => {}
                Err(e) => {
                    warn!(run_id = run.id, error = %e, "liveness check failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Observe the heartbeat of one run and apply the dead/stall policy.
    pub async fn check_run(&self, run_id: i64) -> Result<CheckOutcome> {
        let now = self.clock.now();
        let run = match self.store.observe_heartbeat(run_id, now).await? {
            Some(run) => run,
            None => return Ok(CheckOutcome::Skipped),
        };

        if run.missed_heartbeat_checks >= self.config.dead_after_missed_checks {
            let failure = RunFailure::new(
                FailureReason::LivenessLost,
                format!(
                    "worker liveness lost: heartbeat stuck at {} for {} consecutive checks",
                    run.heartbeat_counter, run.missed_heartbeat_checks
                ),
            );
            return Ok(if self.fail(&run, &failure, now).await? {
                warn!(run_id, worker = ?run.worker_id, "worker declared dead");
                CheckOutcome::FailedDead
            } else {
                CheckOutcome::Skipped
            });
        }

        match evaluate_stall(&run, now, &self.config) {
            StallState::Progressing => Ok(CheckOutcome::Healthy),
            StallState::NewlyStalled => {
                if self.store.flag_stalled(run_id, now).await? {
                    info!(
                        run_id,
                        completed = run.completed_batches,
                        "run flagged as stalled"
                    );
                }
                Ok(CheckOutcome::Stalled)
            }
            StallState::Stalled { since } if now - since >= self.config.stall_grace => {
                let failure = RunFailure::new(
                    FailureReason::Stalled,
                    format!(
                        "indexing stalled: no batch completed since {} ({} of {} batches done)",
                        since.to_rfc3339(),
                        run.completed_batches,
                        run.total_batches
                            .map_or_else(|| "?".to_string(), |t| t.to_string())
                    ),
                );
                Ok(if self.fail(&run, &failure, now).await? {
                    warn!(run_id, "stalled run failed after grace window");
                    CheckOutcome::FailedStalled
                } else {
                    CheckOutcome::Skipped
                })
            }
            StallState::Stalled { .. } => Ok(CheckOutcome::Stalled),
        }
    }

    async fn fail(&self, run: &IndexingRun, failure: &RunFailure, now: DateTime<Utc>) -> Result<bool> {
        self.store
            .transition(
                run.id,
                RunStatus::InProgress,
                RunStatus::Failed,
                Some(failure),
                now,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{BatchStats, NewIndexingRun};
    use crate::store::memory::InMemoryStore;

    struct Harness {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        monitor: LivenessMonitor,
        run_id: i64,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let run = store
            .create_run(&NewIndexingRun::default(), clock.now())
            .await
            .unwrap();
        store.claim_run(run.id, "w1", clock.now()).await.unwrap();
        let monitor = LivenessMonitor::new(
            store.clone(),
            clock.clone(),
            MonitorConfig {
                stall_threshold: Duration::minutes(10),
                stall_grace: Duration::minutes(20),
                dead_after_missed_checks: 2,
            },
        );
        Harness {
            store,
            clock,
            monitor,
            run_id: run.id,
        }
    }

    impl Harness {
        async fn beat(&self) {
            self.store
                .heartbeat(self.run_id, self.clock.now())
                .await
                .unwrap();
        }

        async fn run(&self) -> IndexingRun {
            self.store.get_run(self.run_id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn frozen_heartbeat_fails_after_two_checks() {
        let h = harness().await;
        h.beat().await;
        assert_eq!(h.monitor.check_run(h.run_id).await.unwrap(), CheckOutcome::Healthy);

        // Worker dies: no more beats.
        h.clock.advance(Duration::minutes(1));
        assert_eq!(h.monitor.check_run(h.run_id).await.unwrap(), CheckOutcome::Healthy);
        h.clock.advance(Duration::minutes(1));
        assert_eq!(
            h.monitor.check_run(h.run_id).await.unwrap(),
            CheckOutcome::FailedDead
        );

        let run = h.run().await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_reason, Some(FailureReason::LivenessLost));
        assert!(run.error_msg.unwrap().contains("liveness lost"));
    }

    #[tokio::test]
    async fn advancing_heartbeat_resets_miss_count() {
        let h = harness().await;
        for _ in 0..5 {
            h.monitor.check_run(h.run_id).await.unwrap();
            h.beat().await;
            h.clock.advance(Duration::seconds(30));
        }
        let run = h.run().await;
        assert_eq!(run.status, RunStatus::InProgress);
        assert_eq!(run.missed_heartbeat_checks, 0);
    }

    #[tokio::test]
    async fn stalled_but_alive_fails_only_after_grace() {
        let h = harness().await;

        // Alive, but no batch completes for longer than the threshold.
        h.clock.advance(Duration::minutes(11));
        h.beat().await;
        assert_eq!(h.monitor.check_run(h.run_id).await.unwrap(), CheckOutcome::Stalled);
        let run = h.run().await;
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(run.stalled_since.is_some());

        h.clock.advance(Duration::minutes(10));
        h.beat().await;
        assert_eq!(h.monitor.check_run(h.run_id).await.unwrap(), CheckOutcome::Stalled);

        h.clock.advance(Duration::minutes(11));
        h.beat().await;
        assert_eq!(
            h.monitor.check_run(h.run_id).await.unwrap(),
            CheckOutcome::FailedStalled
        );
        let run = h.run().await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_reason, Some(FailureReason::Stalled));
    }

    #[tokio::test]
    async fn batch_completion_clears_stall() {
        let h = harness().await;
        h.clock.advance(Duration::minutes(11));
        h.beat().await;
        assert_eq!(h.monitor.check_run(h.run_id).await.unwrap(), CheckOutcome::Stalled);

        h.store
            .complete_batch(h.run_id, &BatchStats::default(), h.clock.now())
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(25));
        h.beat().await;
        // Idle 25m since the batch: stalled again, but freshly flagged.
        assert_eq!(h.monitor.check_run(h.run_id).await.unwrap(), CheckOutcome::Stalled);
        assert_eq!(h.run().await.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn terminal_runs_are_skipped() {
        let h = harness().await;
        h.store
            .transition(
                h.run_id,
                RunStatus::InProgress,
                RunStatus::Success,
                None,
                h.clock.now(),
            )
            .await
            .unwrap();
        assert_eq!(h.monitor.check_run(h.run_id).await.unwrap(), CheckOutcome::Skipped);
        let report = h.monitor.sweep().await.unwrap();
        assert_eq!(report.checked, 0);
    }

    #[test]
    fn progress_within_threshold_is_healthy() {
        let now = Utc::now();
        let mut run = IndexingRun::from_new(1, &NewIndexingRun::default(), now);
        run.last_progress_time = Some(now - Duration::minutes(5));
        let config = MonitorConfig::default();
        assert_eq!(evaluate_stall(&run, now, &config), StallState::Progressing);
        run.last_progress_time = Some(now - Duration::hours(1));
        assert_eq!(evaluate_stall(&run, now, &config), StallState::NewlyStalled);
    }

    /// Delegates to the in-memory store but fails heartbeat observation
    /// for one run.
    struct FlakyObserve {
        inner: Arc<InMemoryStore>,
        broken_run: i64,
    }

    #[async_trait::async_trait]
    impl RunStore for FlakyObserve {
        async fn create_run(
            &self,
            new: &NewIndexingRun,
            now: DateTime<Utc>,
        ) -> Result<IndexingRun> {
            self.inner.create_run(new, now).await
        }

        async fn get_run(&self, run_id: i64) -> Result<Option<IndexingRun>> {
            self.inner.get_run(run_id).await
        }

        async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<IndexingRun>> {
            self.inner.list_runs(status).await
        }

        async fn claim_run(
            &self,
            run_id: i64,
            worker_id: &str,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.claim_run(run_id, worker_id, now).await
        }

        async fn transition(
            &self,
            run_id: i64,
            from: RunStatus,
            to: RunStatus,
            failure: Option<&RunFailure>,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.transition(run_id, from, to, failure, now).await
        }

        async fn request_cancellation(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool> {
            self.inner.request_cancellation(run_id, now).await
        }

        async fn dispatch_batch(&self, run_id: i64, now: DateTime<Utc>) -> Result<Option<i64>> {
            self.inner.dispatch_batch(run_id, now).await
        }

        async fn complete_batch(
            &self,
            run_id: i64,
            stats: &BatchStats,
            now: DateTime<Utc>,
        ) -> Result<IndexingRun> {
            self.inner.complete_batch(run_id, stats, now).await
        }

        async fn record_batch_failure(&self, run_id: i64, now: DateTime<Utc>) -> Result<i64> {
            self.inner.record_batch_failure(run_id, now).await
        }

        async fn finalize_total_batches(
            &self,
            run_id: i64,
            total: i64,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.finalize_total_batches(run_id, total, now).await
        }

        async fn heartbeat(&self, run_id: i64, now: DateTime<Utc>) -> Result<i64> {
            self.inner.heartbeat(run_id, now).await
        }

        async fn observe_heartbeat(
            &self,
            run_id: i64,
            now: DateTime<Utc>,
        ) -> Result<Option<IndexingRun>> {
            if run_id == self.broken_run {
                anyhow::bail!("database is locked");
            }
            self.inner.observe_heartbeat(run_id, now).await
        }

        async fn flag_stalled(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool> {
            self.inner.flag_stalled(run_id, now).await
        }

        async fn set_checkpoint_pointer(
            &self,
            run_id: i64,
            pointer: &str,
            now: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.set_checkpoint_pointer(run_id, pointer, now).await
        }
    }

    #[tokio::test]
    async fn store_error_on_one_run_does_not_stop_the_sweep() {
        let h = harness().await;
        let other = h
            .store
            .create_run(&NewIndexingRun::default(), h.clock.now())
            .await
            .unwrap();
        h.store.claim_run(other.id, "w2", h.clock.now()).await.unwrap();

        let monitor = LivenessMonitor::new(
            Arc::new(FlakyObserve {
                inner: h.store.clone(),
                broken_run: h.run_id,
            }),
            h.clock.clone(),
            MonitorConfig {
                stall_threshold: Duration::minutes(10),
                stall_grace: Duration::minutes(20),
                dead_after_missed_checks: 2,
            },
        );

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.healthy, 1);

        // Neither run beats; the one the store can observe is failed dead.
        h.clock.advance(Duration::minutes(1));
        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failed_dead, 1);
        let other = h.store.get_run(other.id).await.unwrap().unwrap();
        assert_eq!(other.status, RunStatus::Failed);
        assert_eq!(h.run().await.status, RunStatus::InProgress);
    }
}
