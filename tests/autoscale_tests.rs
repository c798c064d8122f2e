//! Fast step controller and scale-to-zero watchdog, driven with synthetic
//! clocks.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use fleet_dispatch::autoscale::{
    run_metrics_feed, AutoscaleController, HoldReason, MetricsCollector, ScaleReason, ScaleSource,
    ScaleToZeroWatchdog, ScalingDecision,
};
use fleet_dispatch::config::AutoscaleConfig;
use fleet_dispatch::scheduler::{ClaimRequest, Dispatcher};
use test_harness::{assert_eventually, at, register, submit_request, test_dispatcher, FLEET};

fn controller(d: &Dispatcher) -> AutoscaleController {
    let collector = Arc::new(MetricsCollector::new(d.clone()));
    AutoscaleController::new(d.clone(), collector, &AutoscaleConfig::default())
}

fn watchdog(d: &Dispatcher, started_at: chrono::DateTime<Utc>) -> ScaleToZeroWatchdog {
    let collector = Arc::new(MetricsCollector::new(d.clone()));
    ScaleToZeroWatchdog::starting_at(d.clone(), collector, &AutoscaleConfig::default(), started_at)
}

async fn desired(d: &Dispatcher) -> u32 {
    d.fleet(FLEET).await.unwrap().desired_capacity
}

/// The first job for an empty fleet brings up one instance on the next tick.
#[tokio::test]
async fn test_cold_start_scales_zero_to_one_in_one_tick() {
    let d = test_dispatcher();
    let c = controller(&d);

    let decisions = c.tick(Utc::now()).await;
    assert_eq!(decisions, vec![(FLEET.to_string(), ScalingDecision::Hold(HoldReason::Idle))]);

    d.submit(submit_request("k")).await.unwrap();
    let decisions = c.tick(Utc::now()).await;
    assert_eq!(
        decisions,
        vec![(
            FLEET.to_string(),
            ScalingDecision::Scale {
                desired: 1,
                reason: ScaleReason::ColdStart
            }
        )]
    );
    assert_eq!(desired(&d).await, 1);

    let fleet = d.fleet(FLEET).await.unwrap();
    assert_eq!(fleet.last_scale_source, Some(ScaleSource::Controller));
}

/// Backlog past the per-instance target scales up, clamped to max size.
#[tokio::test]
async fn test_backlog_scales_up_to_max_size() {
    let d = test_dispatcher();
    d.set_desired(FLEET, 1, ScaleSource::Operator, "seed", Utc::now())
        .await
        .unwrap();
    register(&d, 1).await;
    for i in 0..10 {
        d.submit(submit_request(&format!("k{i}"))).await.unwrap();
    }

    let c = controller(&d);
    let decisions = c.tick(Utc::now()).await;
    assert_eq!(
        decisions[0].1,
        ScalingDecision::Scale {
            desired: 4,
            reason: ScaleReason::Backlog
        }
    );
    assert_eq!(desired(&d).await, 4);

    // Still backlogged, but nothing left to add.
    let decisions = c.tick(Utc::now()).await;
    assert_eq!(decisions[0].1, ScalingDecision::Hold(HoldReason::AtMaxSize));
}

/// The fast loop never takes a fleet from one instance to zero.
#[tokio::test]
async fn test_fast_loop_never_scales_to_zero() {
    let d = test_dispatcher();
    d.set_desired(FLEET, 1, ScaleSource::Operator, "seed", Utc::now())
        .await
        .unwrap();

    let c = controller(&d);
    for _ in 0..3 {
        let decisions = c.tick(Utc::now()).await;
        assert_eq!(decisions[0].1, ScalingDecision::Hold(HoldReason::OnTarget));
    }
    assert_eq!(desired(&d).await, 1);
}

/// A quiet fleet above one instance steps down one at a time.
#[tokio::test]
async fn test_low_pressure_steps_down_by_one() {
    let d = test_dispatcher();
    d.set_desired(FLEET, 3, ScaleSource::Operator, "seed", Utc::now())
        .await
        .unwrap();

    let c = controller(&d);
    let decisions = c.tick(Utc::now()).await;
    assert_eq!(
        decisions[0].1,
        ScalingDecision::Scale {
            desired: 2,
            reason: ScaleReason::LowPressure
        }
    );
    assert_eq!(desired(&d).await, 2);
}

/// Only a full window of continuous idleness scales to zero; idle gaps
/// shorter than the window do not.
#[tokio::test]
async fn test_watchdog_requires_sustained_idle_window() {
    let d = test_dispatcher();
    let base = Utc::now();
    d.set_desired(FLEET, 2, ScaleSource::Operator, "seed", base)
        .await
        .unwrap();
    let mut w = watchdog(&d, base - chrono::Duration::minutes(20));

    // Work arrives, so the fleet is busy.
    d.submit(submit_request("k")).await.unwrap();
    assert!(w.tick(at(base, Duration::from_secs(1))).await.is_empty());

    // It drains. Five idle minutes is a transient zero, not a reason to stop.
    let creds = register(&d, 1).await;
    let lease = d.claim(&creds, &ClaimRequest::default()).await.unwrap().remove(0);
    d.complete(&creds, &lease.dispatch_id, &lease.token, json!({}))
        .await
        .unwrap();
    assert!(w.tick(at(base, Duration::from_secs(5 * 60))).await.is_empty());
    assert_eq!(desired(&d).await, 2);

    // Sixteen idle minutes clears the fifteen-minute window.
    let zeroed = w.tick(at(base, Duration::from_secs(16 * 60))).await;
    assert_eq!(zeroed, vec![FLEET.to_string()]);

    let fleet = d.fleet(FLEET).await.unwrap();
    assert_eq!(fleet.desired_capacity, 0);
    assert_eq!(fleet.last_scale_source, Some(ScaleSource::Watchdog));
}

/// In-flight work keeps a fleet alive even with an empty queue.
#[tokio::test]
async fn test_watchdog_keeps_fleet_with_in_flight_work() {
    let d = test_dispatcher();
    let base = Utc::now();
    d.set_desired(FLEET, 1, ScaleSource::Operator, "seed", base)
        .await
        .unwrap();
    d.submit(submit_request("k")).await.unwrap();
    let creds = register(&d, 1).await;
    d.claim(&creds, &ClaimRequest::default()).await.unwrap();

    let mut w = watchdog(&d, base - chrono::Duration::hours(1));
    assert!(w.tick(at(base, Duration::from_secs(60 * 60))).await.is_empty());
    assert_eq!(desired(&d).await, 1);
}

/// The idle clock starts when the watchdog starts, not at the epoch.
#[tokio::test]
async fn test_watchdog_idle_clock_starts_at_startup() {
    let d = test_dispatcher();
    let base = Utc::now();
    d.set_desired(FLEET, 2, ScaleSource::Operator, "seed", base)
        .await
        .unwrap();
    let mut w = watchdog(&d, base);

    assert!(w.tick(at(base, Duration::from_secs(10 * 60))).await.is_empty());
    let zeroed = w.tick(at(base, Duration::from_secs(15 * 60 + 1))).await;
    assert_eq!(zeroed, vec![FLEET.to_string()]);
}

/// The metrics feed publishes snapshots to subscribers.
#[tokio::test]
async fn test_metrics_feed_publishes_snapshots() {
    let d = test_dispatcher();
    d.submit(submit_request("k")).await.unwrap();
    let collector = Arc::new(MetricsCollector::new(d.clone()));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_metrics_feed(
        collector.clone(),
        Duration::from_millis(20),
        shutdown.clone(),
    ));

    assert_eventually(
        || {
            let collector = collector.clone();
            async move {
                collector
                    .latest()
                    .iter()
                    .any(|m| m.fleet == FLEET && m.queue_depth == 1)
            }
        },
        Duration::from_secs(2),
        "metrics feed should publish the queued job",
    )
    .await;

    shutdown.cancel();
    handle.await.unwrap();
}
