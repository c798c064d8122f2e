//! Lease protocol behavior against an in-process dispatcher.


use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use fleet_dispatch::config::FleetConfig;
use fleet_dispatch::error::DispatchError;
use fleet_dispatch::scheduler::{ClaimRequest, DispatchStatus, Dispatcher, JobStatus, LeaseToken, WorkerCredentials};
use test_harness::{fast_config, register, submit_request, test_dispatcher, test_fleet, FLEET, WORKFLOW};

/// Many workers racing for the same pending entries never share one.
#[tokio::test]
async fn test_racing_claims_lease_each_entry_once() {
    let d = test_dispatcher();
    for i in 0..20 {
        d.submit(submit_request(&format!("job-{i}"))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..10 {
        let creds = register(&d, 4).await;
        let d = d.clone();
        handles.push(tokio::spawn(async move {
            d.claim(&creds, &ClaimRequest::default().with_max_batch(4))
                .await
                .unwrap()
        }));
    }

    let mut leased = Vec::new();
    for handle in handles {
        leased.extend(handle.await.unwrap());
    }

    let jobs: HashSet<_> = leased.iter().map(|l| l.job_id).collect();
    assert_eq!(leased.len(), 20, "every entry should be leased");
    assert_eq!(jobs.len(), 20, "no entry should be leased twice");
}

/// Concurrent submits with one idempotency key create exactly one job.
#[tokio::test]
async fn test_concurrent_submits_are_idempotent() {
    let d = test_dispatcher();
    let mut handles = Vec::new();
    for _ in 0..10 {
        let d = d.clone();
        handles.push(tokio::spawn(async move { d.submit(submit_request("same")).await.unwrap() }));
    }

    let mut created = 0;
    let mut ids = HashSet::new();
    for handle in handles {
        let submission = handle.await.unwrap();
        if submission.is_created() {
            created += 1;
        }
        ids.insert(submission.job().id);
    }
    assert_eq!(created, 1);
    assert_eq!(ids.len(), 1);
}

/// A finished job frees its key for a new submission.
#[tokio::test]
async fn test_idempotency_key_reusable_after_terminal() {
    let d = test_dispatcher();
    let first = d.submit(submit_request("k")).await.unwrap().into_job();
    let creds = register(&d, 1).await;
    let lease = d.claim(&creds, &ClaimRequest::default()).await.unwrap().remove(0);
    d.complete(&creds, &lease.dispatch_id, &lease.token, json!({}))
        .await
        .unwrap();

    let second = d.submit(submit_request("k")).await.unwrap();
    assert!(second.is_created());
    assert_ne!(second.job().id, first.id);
}

/// Heartbeats push the lease expiry forward.
#[tokio::test]
async fn test_heartbeat_extends_lease() {
    let d = test_dispatcher();
    d.submit(submit_request("k")).await.unwrap();
    let creds = register(&d, 1).await;
    let lease = d.claim(&creds, &ClaimRequest::default()).await.unwrap().remove(0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let renewal = d.heartbeat(&creds, &lease.dispatch_id, &lease.token).await.unwrap();
    assert!(renewal.expires_at > lease.expires_at);

    let entry = d.dispatch_entry_for(&lease.job_id).await.unwrap();
    assert_eq!(entry.status, DispatchStatus::Running);
    assert_eq!(entry.lease_expires_at, Some(renewal.expires_at));
}

/// Abandoning hands the entry back without counting an attempt.
#[tokio::test]
async fn test_abandon_does_not_count_attempt() {
    let d = test_dispatcher();
    let job = d.submit(submit_request("k")).await.unwrap().into_job();
    let creds = register(&d, 1).await;
    let lease = d.claim(&creds, &ClaimRequest::default()).await.unwrap().remove(0);

    d.abandon(&creds, &lease.dispatch_id, &lease.token).await.unwrap();

    let entry = d.dispatch_entry_for(&job.id).await.unwrap();
    assert_eq!(entry.status, DispatchStatus::Pending);
    assert_eq!(entry.attempts, 0);
    assert_eq!(d.get_job(&job.id).await.unwrap().status, JobStatus::Queued);

    let again = d.claim(&creds, &ClaimRequest::default()).await.unwrap().remove(0);
    assert_eq!(again.attempt, 1);
    assert_ne!(again.token, lease.token);
}

/// Only the current lease holder may act on a lease.
#[tokio::test]
async fn test_other_worker_cannot_touch_lease() {
    let d = test_dispatcher();
    d.submit(submit_request("k")).await.unwrap();
    let holder = register(&d, 1).await;
    let intruder = register(&d, 1).await;
    let lease = d.claim(&holder, &ClaimRequest::default()).await.unwrap().remove(0);

    let err = d
        .complete(&intruder, &lease.dispatch_id, &lease.token, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::LeaseMismatch { .. }));

    let err = d
        .abandon(&holder, &lease.dispatch_id, &LeaseToken::generate())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::LeaseMismatch { .. }));
}

/// Lower priority values are leased first; ties go to the oldest entry.
#[tokio::test]
async fn test_claim_order_follows_priority_then_age() {
    let d = test_dispatcher();
    let low = d
        .submit(submit_request("low").with_priority(9))
        .await
        .unwrap()
        .into_job();
    let urgent_a = d
        .submit(submit_request("urgent-a").with_priority(1))
        .await
        .unwrap()
        .into_job();
    let urgent_b = d
        .submit(submit_request("urgent-b").with_priority(1))
        .await
        .unwrap()
        .into_job();

    let creds = register(&d, 3).await;
    let leases = d
        .claim(&creds, &ClaimRequest::default().with_max_batch(3))
        .await
        .unwrap();
    let order: Vec<_> = leases.iter().map(|l| l.job_id).collect();
    assert_eq!(order, vec![urgent_a.id, urgent_b.id, low.id]);
}

/// A worker only receives work for workflows it declared.
#[tokio::test]
async fn test_claim_filters_by_capability() {
    let d = test_dispatcher();
    d.submit(submit_request("k")).await.unwrap();
    let creds = register(&d, 1).await;

    let none = d
        .claim(
            &creds,
            &ClaimRequest {
                capabilities: vec!["whisper".to_string()],
                ..ClaimRequest::default()
            },
        )
        .await
        .unwrap();
    assert!(none.is_empty());

    let some = d.claim(&creds, &ClaimRequest::default()).await.unwrap();
    assert_eq!(some.len(), 1);
}

/// An unapproved worker is refused leases until an operator approves it.
#[tokio::test]
async fn test_unapproved_worker_waits_for_approval() {
    let mut config = test_harness::fast_config();
    config.auto_approve_workers = false;
    let d = fleet_dispatch::scheduler::Dispatcher::new(config, vec![test_harness::test_fleet()]);
    d.submit(submit_request("k")).await.unwrap();
    let creds = register(&d, 1).await;

    let err = d.claim(&creds, &ClaimRequest::default()).await.unwrap_err();
    assert!(matches!(err, DispatchError::WorkerUnavailable { .. }));

    d.approve(&creds.worker_id).await.unwrap();
    assert_eq!(d.claim(&creds, &ClaimRequest::default()).await.unwrap().len(), 1);
}

/// Stats reflect live leases and job states.
#[tokio::test]
async fn test_stats_count_live_leases() {
    let d = test_dispatcher();
    d.submit(submit_request("a")).await.unwrap();
    d.submit(submit_request("b")).await.unwrap();
    let creds = register(&d, 1).await;
    d.claim(&creds, &ClaimRequest::default()).await.unwrap();

    let stats = d.stats().await;
    assert_eq!(stats.live_leases, 1);
    assert_eq!(stats.dispatch_entries, 2);
    assert_eq!(stats.jobs.get(&JobStatus::Queued), Some(&1));
    assert_eq!(stats.jobs.get(&JobStatus::Dispatched), Some(&1));

    let views = d.list_workers().await;
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].load, 1);
    assert!(views[0].alive);
}

/// Parallel claims from one worker never push it past its concurrency.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_claims_respect_max_concurrency() {
    let d = test_dispatcher();
    for i in 0..50 {
        d.submit(submit_request(&format!("job-{i}"))).await.unwrap();
    }
    let creds = register(&d, 1).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let d = d.clone();
        let creds = creds.clone();
        handles.push(tokio::spawn(async move {
            d.claim(&creds, &ClaimRequest::default().with_max_batch(4))
                .await
                .unwrap()
                .len()
        }));
    }
    for _ in 0..4 {
        let d = d.clone();
        handles.push(tokio::spawn(async move {
            d.stats().await;
            0
        }));
    }

    let mut granted = 0;
    for handle in handles {
        granted += handle.await.unwrap();
    }
    assert_eq!(granted, 1);
    assert_eq!(d.stats().await.live_leases, 1);
}

/// Finished jobs do not hold queue capacity until retention purges them.
#[tokio::test]
async fn test_finished_jobs_free_queue_capacity() {
    let mut config = fast_config();
    config.max_entries = 3;
    let d = Dispatcher::new(config, vec![test_fleet()]);
    let creds = register(&d, 3).await;

    for i in 0..3 {
        d.submit(submit_request(&format!("k{i}"))).await.unwrap();
    }
    let err = d.submit(submit_request("overflow")).await.unwrap_err();
    assert_eq!(err, DispatchError::QueueFull);

    let leases = d
        .claim(&creds, &ClaimRequest::default().with_max_batch(3))
        .await
        .unwrap();
    for lease in &leases {
        d.complete(&creds, &lease.dispatch_id, &lease.token, json!({}))
            .await
            .unwrap();
    }

    assert!(d.submit(submit_request("after")).await.unwrap().is_created());
}

/// Stage fleets sharing a workflow keep separate queues and workers.
#[tokio::test]
async fn test_stage_fleets_do_not_share_work() {
    let staging = FleetConfig::new("sdxl-staging", WORKFLOW, 2).with_warmup_seconds(0);
    let d = Dispatcher::new(fast_config(), vec![test_fleet(), staging]);
    for i in 0..5 {
        d.submit(submit_request(&format!("prod-{i}"))).await.unwrap();
    }
    let staged = d
        .submit(submit_request("stage-0").with_fleet("sdxl-staging"))
        .await
        .unwrap()
        .into_job();

    let snapshot = d.fleet_snapshot(Utc::now()).await;
    let depth = |slug: &str| {
        snapshot
            .iter()
            .find(|s| s.fleet.slug() == slug)
            .map(|s| s.queue_depth)
            .unwrap()
    };
    assert_eq!(depth(FLEET), 5);
    assert_eq!(depth("sdxl-staging"), 1);

    let reg = d
        .register("sdxl-staging", vec![WORKFLOW.to_string()], 4)
        .await
        .unwrap();
    let staging_worker = WorkerCredentials::new(reg.worker.id, reg.token);
    let leases = d
        .claim(&staging_worker, &ClaimRequest::default().with_max_batch(4))
        .await
        .unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].job_id, staged.id);

    let err = d
        .submit(submit_request("wrong").with_fleet("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::FleetNotFound(_)));
}
