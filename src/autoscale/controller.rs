//! Fast step controller.
//!
//! Two regimes share one tick: a cold start rule that takes an empty fleet
//! to one worker as soon as anything is queued, and a damped 1→N rule that
//! tracks the backlog target and respects the fleet's warm-up cooldown.
//! Scaling to zero is left to the [`watchdog`](super::watchdog).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::autoscale::fleet::{Fleet, ScaleSource};
use crate::autoscale::metrics::{target_capacity, FleetMetrics, MetricsCollector};
use crate::config::AutoscaleConfig;
use crate::error::DispatchError;
use crate::scheduler::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleReason {
    /// Work is queued and the fleet has no capacity at all.
    ColdStart,
    /// Backlog per running worker is above target.
    Backlog,
    /// Backlog is on target and observed waits are well under the SLO.
    LowPressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    WarmingUp,
    OnTarget,
    /// Nothing queued and nothing desired.
    Idle,
    /// Backlog wants more workers than `max_size` allows.
    AtMaxSize,
}

impl fmt::Display for ScaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleReason::ColdStart => write!(f, "cold start"),
            ScaleReason::Backlog => write!(f, "backlog above target"),
            ScaleReason::LowPressure => write!(f, "low slo pressure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Scale { desired: u32, reason: ScaleReason },
    Hold(HoldReason),
}

/// Pure decision rule for one fleet and one metrics sample.
#[derive(Debug, Clone)]
pub struct StepPolicy {
    pub low_pressure_threshold: f64,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            low_pressure_threshold: AutoscaleConfig::default().low_pressure_threshold,
        }
    }
}

impl StepPolicy {
    pub fn evaluate(&self, fleet: &Fleet, metrics: &FleetMetrics, now: DateTime<Utc>) -> ScalingDecision {
        let config = &fleet.config;
        let current = fleet.desired_capacity;

        // 0 -> 1 ignores both cooldown and pressure.
        if current == 0 {
            if metrics.queue_depth == 0 {
                return ScalingDecision::Hold(HoldReason::Idle);
            }
            if config.max_size == 0 {
                return ScalingDecision::Hold(HoldReason::AtMaxSize);
            }
            return ScalingDecision::Scale {
                desired: 1,
                reason: ScaleReason::ColdStart,
            };
        }

        if fleet.in_warmup(now) {
            return ScalingDecision::Hold(HoldReason::WarmingUp);
        }

        if metrics.backlog_per_instance > config.backlog_target as f64 {
            let wanted = (current + 1).max(target_capacity(metrics.queue_depth, config.backlog_target));
            let desired = wanted.min(config.max_size);
            if desired <= current {
                return ScalingDecision::Hold(HoldReason::AtMaxSize);
            }
            return ScalingDecision::Scale {
                desired,
                reason: ScaleReason::Backlog,
            };
        }

        let pressure = metrics.slo_pressure.unwrap_or(0.0);
        if pressure < self.low_pressure_threshold && current > 1 {
            return ScalingDecision::Scale {
                desired: current - 1,
                reason: ScaleReason::LowPressure,
            };
        }

        ScalingDecision::Hold(HoldReason::OnTarget)
    }
}

/// Runs [`StepPolicy`] over every fleet on the fast interval.
pub struct AutoscaleController {
    dispatcher: Dispatcher,
    collector: Arc<MetricsCollector>,
    policy: StepPolicy,
    interval: Duration,
}

impl AutoscaleController {
    pub fn new(dispatcher: Dispatcher, collector: Arc<MetricsCollector>, config: &AutoscaleConfig) -> Self {
        Self {
            dispatcher,
            collector,
            policy: StepPolicy {
                low_pressure_threshold: config.low_pressure_threshold,
            },
            interval: config.fast_interval,
        }
    }

    /// One evaluation pass. Returns the decision taken for each fleet.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<(String, ScalingDecision)> {
        let metrics = self.collector.collect(now).await;
        let fleets: HashMap<String, Fleet> = self
            .dispatcher
            .fleets()
            .await
            .into_iter()
            .map(|f| (f.config.slug.clone(), f))
            .collect();

        let mut decisions = Vec::with_capacity(metrics.len());
        for m in &metrics {
            let Some(fleet) = fleets.get(&m.fleet) else {
                continue;
            };
            let decision = self.policy.evaluate(fleet, m, now);

            match decision {
                ScalingDecision::Scale { desired, reason } => {
                    let reason_text = reason.to_string();
                    if let Err(e) = self
                        .dispatcher
                        .set_desired(&m.fleet, desired, ScaleSource::Controller, &reason_text, now)
                        .await
                    {
                        tracing::warn!(fleet = %m.fleet, error = %e, "Failed to apply scaling decision");
                    }
                }
                ScalingDecision::Hold(HoldReason::AtMaxSize) => {
                    let signal = DispatchError::CapacityExhausted {
                        fleet: m.fleet.clone(),
                        max_size: fleet.config.max_size,
                    };
                    tracing::warn!(queue_depth = m.queue_depth, "{}", signal);
                }
                ScalingDecision::Hold(reason) => {
                    tracing::trace!(fleet = %m.fleet, reason = ?reason, "Holding capacity");
                }
            }
            decisions.push((m.fleet.clone(), decision));
        }
        decisions
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Autoscale controller started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Autoscale controller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }
}
