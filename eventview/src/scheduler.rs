//! Per-projection tick loop with jitter, triggers and failure backoff.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::worker::Worker;

/// Drives one worker on its requeue interval, on external triggers and
/// without delay while a backlog remains.
pub(crate) struct Scheduler {
    worker: Arc<Worker>,
    shutdown: watch::Receiver<bool>,
    triggers: mpsc::Receiver<()>,
}

impl Scheduler {
    pub(crate) const fn new(
        worker: Arc<Worker>,
        shutdown: watch::Receiver<bool>,
        triggers: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            worker,
            shutdown,
            triggers,
        }
    }

    /// Loop until shutdown. A tick in progress always runs to completion, so
    /// a batch transaction is never abandoned halfway.
    pub(crate) async fn run(mut self) {
        let requeue = self.worker.config().requeue_every;
        let mut delay = first_delay(requeue);
        info!(
            projection = %self.worker.name(),
            requeue_ms = u64::try_from(requeue.as_millis()).unwrap_or(u64::MAX),
            "[scheduler.start] projection scheduled"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(()) = self.triggers.recv() => {
                    debug!(projection = %self.worker.name(), "[scheduler.trigger] triggered");
                }
                () = sleep(delay) => {}
            }
            if *self.shutdown.borrow() {
                break;
            }

            delay = match self.worker.run_once().await {
                Ok(report) if report.backlog => Duration::ZERO,
                Ok(report) => next_delay(requeue, report.retry_after),
                Err(error) => {
                    warn!(
                        projection = %self.worker.name(),
                        error = %error,
                        "[scheduler.tick_failed] tick failed"
                    );
                    requeue
                }
            };
        }

        info!(projection = %self.worker.name(), "[scheduler.stop] projection stopped");
    }
}

/// Wait at least `requeue`, longer when every instance is stalled.
fn next_delay(requeue: Duration, retry_after: Option<Duration>) -> Duration {
    retry_after.map_or(requeue, |wait| wait.max(requeue))
}

/// Spread the first tick of many projections over a tenth of the interval.
fn first_delay(requeue: Duration) -> Duration {
    let spread = u64::try_from(requeue.as_millis() / 10).unwrap_or(u64::MAX);
    if spread == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=spread))
}
