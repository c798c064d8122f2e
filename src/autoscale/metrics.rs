//! Per-fleet scaling signals shared by both autoscaling loops and the
//! external metrics feed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Dispatcher;

const MAX_SAMPLES_PER_WORKFLOW: usize = 4096;

/// Sliding window of queue wait times (enqueue to lease), per workflow.
#[derive(Debug)]
pub struct WaitSampler {
    window: Duration,
    samples: HashMap<String, VecDeque<(DateTime<Utc>, u64)>>,
}

impl WaitSampler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: HashMap::new(),
        }
    }

    pub fn record(&mut self, workflow_id: &str, waited_ms: u64, at: DateTime<Utc>) {
        let samples = self.samples.entry(workflow_id.to_string()).or_default();
        samples.push_back((at, waited_ms));
        while samples.len() > MAX_SAMPLES_PER_WORKFLOW {
            samples.pop_front();
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let cutoff = now - window;
        for samples in self.samples.values_mut() {
            while samples.front().is_some_and(|(at, _)| *at < cutoff) {
                samples.pop_front();
            }
        }
    }

    /// Nearest-rank 95th percentile of waits inside the window.
    pub fn p95(&mut self, workflow_id: &str, now: DateTime<Utc>) -> Option<u64> {
        self.prune(now);
        let samples = self.samples.get(workflow_id)?;
        if samples.is_empty() {
            return None;
        }
        let mut waits: Vec<u64> = samples.iter().map(|(_, w)| *w).collect();
        waits.sort_unstable();
        let rank = ((waits.len() as f64) * 0.95).ceil() as usize;
        waits.get(rank.saturating_sub(1)).copied()
    }
}

/// One fleet's scaling signals at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetMetrics {
    pub fleet: String,
    pub workflow_id: String,
    /// Pending dispatch entries, including ones waiting out a retry backoff.
    pub queue_depth: usize,
    pub in_flight: usize,
    pub running_workers: usize,
    pub backlog_per_instance: f64,
    pub p95_wait_ms: Option<u64>,
    /// Observed p95 wait divided by the fleet's target wait.
    pub slo_pressure: Option<f64>,
    pub desired_capacity: u32,
    pub max_size: u32,
    /// Backlog exceeds what `max_size` workers can absorb at target.
    pub capacity_exhausted: bool,
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub sampled_at: DateTime<Utc>,
}

impl FleetMetrics {
    pub fn is_idle(&self) -> bool {
        self.queue_depth == 0 && self.in_flight == 0
    }
}

/// Workers needed to bring the backlog down to `backlog_target` each.
pub fn target_capacity(queue_depth: usize, backlog_target: u32) -> u32 {
    let target = backlog_target.max(1) as usize;
    let needed = queue_depth.div_ceil(target);
    u32::try_from(needed).unwrap_or(u32::MAX)
}

/// Computes [`FleetMetrics`] from the dispatcher's tables and publishes the
/// latest snapshot on a watch channel.
pub struct MetricsCollector {
    dispatcher: Dispatcher,
    feed: watch::Sender<Vec<FleetMetrics>>,
}

impl MetricsCollector {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (feed, _rx) = watch::channel(Vec::new());
        Self {
            dispatcher,
            feed,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<FleetMetrics>> {
        self.feed.subscribe()
    }

    /// Latest published snapshot.
    pub fn latest(&self) -> Vec<FleetMetrics> {
        self.feed.borrow().clone()
    }

    pub fn publish(&self, metrics: Vec<FleetMetrics>) {
        self.feed.send_replace(metrics);
    }

    pub async fn collect(&self, now: DateTime<Utc>) -> Vec<FleetMetrics> {
        let raw = self.dispatcher.fleet_snapshot(now).await;

        raw.into_iter()
            .map(|snap| {
                let backlog_per_instance =
                    snap.queue_depth as f64 / snap.running_workers.max(1) as f64;
                let slo_pressure = match (snap.p95_wait_ms, snap.fleet.config.slo_target_wait_secs) {
                    (Some(p95), target) if target > 0 => Some(p95 as f64 / (target as f64 * 1000.0)),
                    _ => None,
                };
                let config = &snap.fleet.config;
                let capacity_exhausted =
                    target_capacity(snap.queue_depth, config.backlog_target) > config.max_size;

                FleetMetrics {
                    fleet: config.slug.clone(),
                    workflow_id: config.workflow_id.clone(),
                    queue_depth: snap.queue_depth,
                    in_flight: snap.in_flight,
                    running_workers: snap.running_workers,
                    backlog_per_instance,
                    p95_wait_ms: snap.p95_wait_ms,
                    slo_pressure,
                    desired_capacity: snap.fleet.desired_capacity,
                    max_size: config.max_size,
                    capacity_exhausted,
                    last_enqueued_at: snap.last_enqueued_at,
                    sampled_at: now,
                }
            })
            .collect()
    }
}

/// Emit metrics at a fixed interval until shutdown.
pub async fn run_metrics_feed(
    collector: Arc<MetricsCollector>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Metrics feed stopping");
                break;
            }
            _ = ticker.tick() => {
                let metrics = collector.collect(Utc::now()).await;
                for m in &metrics {
                    tracing::debug!(
                        fleet = %m.fleet,
                        queue_depth = m.queue_depth,
                        in_flight = m.in_flight,
                        running_workers = m.running_workers,
                        backlog_per_instance = m.backlog_per_instance,
                        slo_pressure = ?m.slo_pressure,
                        desired_capacity = m.desired_capacity,
                        "Fleet metrics"
                    );
                    if m.capacity_exhausted {
                        tracing::warn!(
                            fleet = %m.fleet,
                            queue_depth = m.queue_depth,
                            max_size = m.max_size,
                            "Fleet at max size, backlog growing"
                        );
                    }
                }
                collector.publish(metrics);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p95_uses_nearest_rank() {
        let mut sampler = WaitSampler::new(Duration::from_secs(300));
        let now = Utc::now();
        for wait in 1..=100 {
            sampler.record("wf", wait, now);
        }
        assert_eq!(sampler.p95("wf", now), Some(95));
        assert_eq!(sampler.p95("other", now), None);
    }

    #[test]
    fn p95_drops_samples_outside_window() {
        let mut sampler = WaitSampler::new(Duration::from_secs(60));
        let now = Utc::now();
        sampler.record("wf", 10_000, now - chrono::Duration::seconds(120));
        sampler.record("wf", 50, now);
        assert_eq!(sampler.p95("wf", now), Some(50));

        let later = now + chrono::Duration::seconds(61);
        assert_eq!(sampler.p95("wf", later), None);
    }

    #[test]
    fn target_capacity_rounds_up() {
        assert_eq!(target_capacity(0, 4), 0);
        assert_eq!(target_capacity(1, 4), 1);
        assert_eq!(target_capacity(8, 4), 2);
        assert_eq!(target_capacity(9, 4), 3);
    }

    #[test]
    fn single_sample_is_its_own_p95() {
        let mut sampler = WaitSampler::new(Duration::from_secs(60));
        let now = Utc::now();
        sampler.record("wf", 42, now);
        assert_eq!(sampler.p95("wf", now), Some(42));
    }
}
