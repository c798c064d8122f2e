use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::autoscale::fleet::ScaleSource;
use crate::autoscale::metrics::{FleetMetrics, MetricsCollector};
use crate::config::AutoscaleConfig;
use crate::scheduler::Dispatcher;

/// Slow loop that takes idle fleets to zero.
///
/// Keeps its own record of when each fleet was last busy, so a single
/// empty sample between bursts never counts as sustained idleness. A fleet
/// that has never been seen busy measures its window from watchdog start.
pub struct ScaleToZeroWatchdog {
    dispatcher: Dispatcher,
    collector: Arc<MetricsCollector>,
    interval: Duration,
    started_at: DateTime<Utc>,
    busy_at: HashMap<String, DateTime<Utc>>,
}

impl ScaleToZeroWatchdog {
    pub fn new(dispatcher: Dispatcher, collector: Arc<MetricsCollector>, config: &AutoscaleConfig) -> Self {
        Self::starting_at(dispatcher, collector, config, Utc::now())
    }

    pub fn starting_at(
        dispatcher: Dispatcher,
        collector: Arc<MetricsCollector>,
        config: &AutoscaleConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dispatcher,
            collector,
            interval: config.watchdog_interval,
            started_at,
            busy_at: HashMap::new(),
        }
    }

    /// Fold one sample into the busy clock. Returns how long the fleet has
    /// been idle, or `None` if it is busy right now.
    pub fn observe(&mut self, metrics: &FleetMetrics, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let busy_at = self
            .busy_at
            .entry(metrics.fleet.clone())
            .or_insert(self.started_at);
        if let Some(enqueued) = metrics.last_enqueued_at {
            *busy_at = (*busy_at).max(enqueued);
        }
        if !metrics.is_idle() {
            *busy_at = now;
            return None;
        }
        Some(now.signed_duration_since(*busy_at))
    }

    /// One evaluation pass. Returns the fleets that were scaled to zero.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let metrics = self.collector.collect(now).await;
        let mut zeroed = Vec::new();

        for fleet in self.dispatcher.fleets().await {
            let Some(m) = metrics.iter().find(|m| m.fleet == fleet.config.slug) else {
                continue;
            };
            let Some(idle_for) = self.observe(m, now) else {
                continue;
            };
            if fleet.desired_capacity == 0 {
                continue;
            }
            let window = chrono::Duration::from_std(fleet.config.scale_to_zero_window())
                .unwrap_or(chrono::Duration::MAX);
            if idle_for < window {
                tracing::debug!(
                    fleet = %m.fleet,
                    idle_secs = idle_for.num_seconds(),
                    window_secs = window.num_seconds(),
                    "Fleet idle, window not yet elapsed"
                );
                continue;
            }

            let reason = format!("idle for {} minutes", idle_for.num_minutes());
            match self
                .dispatcher
                .set_desired(&m.fleet, 0, ScaleSource::Watchdog, &reason, now)
                .await
            {
                Ok(true) => zeroed.push(m.fleet.clone()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(fleet = %m.fleet, error = %e, "Failed to scale fleet to zero")
                }
            }
        }
        zeroed
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Scale-to-zero watchdog started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scale-to-zero watchdog stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }
}
