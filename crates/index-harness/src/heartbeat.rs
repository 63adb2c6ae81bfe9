//! Worker heartbeat task.
//!
//! While a worker owns a run, a background task increments the run's
//! `heartbeat_counter` every `heartbeat_interval`. The task is independent
//! of batch progress: a worker stuck inside one slow connector call keeps
//! beating, which is what lets the monitor tell "stalled" from "dead".

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use index_harness_core::clock::Clock;
use index_harness_core::store::RunStore;

/// Handle to a running heartbeat task.
pub struct Heartbeat {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Start beating for `run_id`. The first beat is sent immediately.
    pub fn spawn(
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
        run_id: i64,
        interval: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.heartbeat(run_id, clock.now()).await {
                            Ok(counter) => debug!(run_id, counter, "heartbeat"),
                            Err(e) => warn!(run_id, error = %e, "heartbeat write failed"),
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self { stop, task }
    }

    /// Stop beating and wait for the task to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use index_harness_core::clock::SystemClock;
    use index_harness_core::models::NewIndexingRun;
    use index_harness_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn beats_until_stopped() {
        let store = Arc::new(InMemoryStore::new());
        let run = store
            .create_run(&NewIndexingRun::default(), Utc::now())
            .await
            .unwrap();

        let heartbeat = Heartbeat::spawn(
            store.clone(),
            Arc::new(SystemClock),
            run.id,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        heartbeat.stop().await;

        let after_stop = store.get_run(run.id).await.unwrap().unwrap().heartbeat_counter;
        assert!(after_stop >= 2, "expected several beats, got {}", after_stop);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let later = store.get_run(run.id).await.unwrap().unwrap().heartbeat_counter;
        assert_eq!(after_stop, later);
    }
}
