use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::processor::{BatchReport, ReconciliationEngine};

#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Ran(BatchReport),
    /// A previous run was still active.
    Skipped,
    Failed(String),
}

/// Runs the reconciliation engine on a fixed interval. At most one batch is
/// active at a time; a tick that fires during a run is dropped, not queued.
pub struct BatchScheduler {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
    running: AtomicBool,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BatchScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>, interval: Duration) -> Self {
        Self { engine, interval, running: AtomicBool::new(false) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn tick(&self) -> TickOutcome {
        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            debug!(
                event_name = "system.scheduler.tick_skipped",
                "batch still running, skipping tick"
            );
            return TickOutcome::Skipped;
        }
        let _guard = RunGuard(&self.running);

        match self.engine.run_batch().await {
            Ok(report) => TickOutcome::Ran(report),
            Err(error) => {
                error!(
                    event_name = "system.scheduler.batch_failed",
                    error_class = error.error_class(),
                    error = %error,
                    "reconciliation batch failed"
                );
                TickOutcome::Failed(error.to_string())
            }
        }
    }

    /// Ticks until `shutdown` flips to true, then waits for the batch in
    /// flight. Each batch runs on its own task so a slow batch surfaces as
    /// skipped ticks instead of a stalled timer.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            event_name = "system.scheduler.started",
            interval_secs = self.interval.as_secs(),
            batch_size = self.engine.batch_size(),
            "batch scheduler started"
        );

        let mut in_flight: Option<JoinHandle<TickOutcome>> = None;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if in_flight.as_ref().is_some_and(|handle| !handle.is_finished()) {
                        debug!(
                            event_name = "system.scheduler.tick_skipped",
                            "batch still running, skipping tick"
                        );
                        continue;
                    }
                    let scheduler = Arc::clone(&self);
                    in_flight = Some(tokio::spawn(async move { scheduler.tick().await }));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = in_flight {
            let _ = handle.await;
        }
        info!(event_name = "system.scheduler.stopped", "batch scheduler stopped");
    }
}
