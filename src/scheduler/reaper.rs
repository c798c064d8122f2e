use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::scheduler::dispatcher::Dispatcher;

/// Periodically sweeps the dispatch table for leases nobody is renewing.
///
/// Runs next to the dispatcher and never blocks a claim for longer than one
/// table write. A pass that finds nothing logs nothing.
pub struct Reaper {
    dispatcher: Dispatcher,
    interval: Duration,
}

impl Reaper {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let interval = dispatcher.config().reaper_interval;
        Self {
            dispatcher,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reaper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.dispatcher.reap(Utc::now()).await;
                    if !report.is_empty() {
                        tracing::info!(
                            reclaimed = report.reclaimed,
                            exhausted = report.exhausted,
                            expired = report.expired,
                            purged = report.purged,
                            pruned_workers = report.pruned_workers,
                            "Reaper pass"
                        );
                    }
                }
            }
        }
    }
}
