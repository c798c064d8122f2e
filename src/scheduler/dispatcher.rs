use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use crate::autoscale::fleet::{Fleet, FleetRegistry, ScaleSource};
use crate::autoscale::metrics::WaitSampler;
use crate::config::{AutoscaleConfig, DispatchConfig, FleetConfig, ServerConfig};
use crate::error::{DispatchError, Result};
use crate::scheduler::dispatch::{
    DispatchEntry, DispatchStatus, DispatchTable, LeaseToken, UNROUTED_PROVIDER,
};
use crate::scheduler::job::{Job, JobStatus, SubmitRequest};
use crate::scheduler::ledger::JobLedger;
use crate::scheduler::registry::{Registration, Worker, WorkerRegistry};

const CLAIM_RECHECK: Duration = Duration::from_secs(1);

/// Worker identity presented on every lease call.
#[derive(Clone, Serialize, Deserialize)]
pub struct WorkerCredentials {
    pub worker_id: Uuid,
    pub token: String,
}

impl WorkerCredentials {
    pub fn new(worker_id: Uuid, token: impl Into<String>) -> Self {
        Self {
            worker_id,
            token: token.into(),
        }
    }
}

impl fmt::Debug for WorkerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCredentials")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

fn default_batch() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Workflows to claim for; empty means every declared capability.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_batch")]
    pub max_batch: usize,
    /// Long-poll budget when nothing is claimable right away.
    #[serde(default)]
    pub wait_ms: u64,
}

impl Default for ClaimRequest {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            max_batch: default_batch(),
            wait_ms: 0,
        }
    }
}

impl ClaimRequest {
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_ms = wait.as_millis() as u64;
        self
    }
}

/// A granted lease, as handed to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub dispatch_id: Uuid,
    pub job_id: Uuid,
    pub tenant_id: String,
    pub workflow_id: String,
    pub priority: i32,
    /// 1-based attempt this lease represents.
    pub attempt: u32,
    pub payload: Value,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRenewal {
    pub dispatch_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompleteOutcome {
    Completed,
    /// The job was already terminal; the report changed nothing.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    Retrying {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    Exhausted {
        attempts: u32,
    },
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainAck {
    pub worker_id: Uuid,
    /// Leases handed back to the queue.
    pub abandoned: usize,
    /// Leases the worker still holds and is expected to finish.
    pub in_flight: usize,
}

/// Outcome of `submit`: a fresh job, or the live job that already owns
/// the idempotency key.
#[derive(Debug, Clone)]
pub enum Submission {
    Created(Job),
    Existing(Job),
}

impl Submission {
    pub fn job(&self) -> &Job {
        match self {
            Submission::Created(job) | Submission::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Submission::Created(job) | Submission::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Submission::Created(_))
    }
}

/// What one reaper pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    /// Leases returned to the queue.
    pub reclaimed: usize,
    /// Leases whose job ran out of attempts.
    pub exhausted: usize,
    /// Queued jobs past their TTL.
    pub expired: usize,
    /// Terminal jobs dropped after retention.
    pub purged: usize,
    pub pruned_workers: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == ReapReport::default()
    }
}

/// A worker plus its derived load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub worker: Worker,
    pub load: usize,
    pub alive: bool,
}

/// Raw per-fleet counters, read in one consistent pass.
#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    pub fleet: Fleet,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub running_workers: usize,
    pub p95_wait_ms: Option<u64>,
    pub last_enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub jobs: HashMap<JobStatus, usize>,
    pub dispatch_entries: usize,
    pub workers: usize,
    pub live_leases: usize,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn lease_for(entry: &DispatchEntry, heartbeat_interval: Duration) -> Option<Lease> {
    Some(Lease {
        dispatch_id: entry.id,
        job_id: entry.job_id,
        tenant_id: entry.tenant_id.clone(),
        workflow_id: entry.workflow_id.clone(),
        priority: entry.priority,
        attempt: entry.attempts + 1,
        payload: entry.payload.clone(),
        token: entry.lease_token?,
        expires_at: entry.lease_expires_at?,
        heartbeat_interval_ms: heartbeat_interval.as_millis() as u64,
    })
}

/// Ties the job ledger, dispatch table, worker registry and fleet registry
/// together behind the lease protocol.
///
/// Locks are always taken in the order ledger, table, workers, fleets,
/// wait samples.
#[derive(Clone)]
pub struct Dispatcher {
    config: DispatchConfig,
    ledger: Arc<RwLock<JobLedger>>,
    table: Arc<RwLock<DispatchTable>>,
    workers: Arc<RwLock<WorkerRegistry>>,
    fleets: Arc<RwLock<FleetRegistry>>,
    waits: Arc<Mutex<WaitSampler>>,
    work_available: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, fleets: Vec<FleetConfig>) -> Self {
        Self::with_wait_window(config, fleets, AutoscaleConfig::default().wait_sample_window)
    }

    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self::with_wait_window(
            config.dispatch.clone(),
            config.fleets.clone(),
            config.autoscale.wait_sample_window,
        )
    }

    pub fn with_wait_window(config: DispatchConfig, fleets: Vec<FleetConfig>, window: Duration) -> Self {
        let workers = WorkerRegistry::new(config.dead_worker_after, config.auto_approve_workers);
        Self {
            ledger: Arc::new(RwLock::new(JobLedger::new())),
            table: Arc::new(RwLock::new(DispatchTable::with_capacity(config.max_entries))),
            workers: Arc::new(RwLock::new(workers)),
            fleets: Arc::new(RwLock::new(FleetRegistry::new(fleets))),
            waits: Arc::new(Mutex::new(WaitSampler::new(window))),
            work_available: Arc::new(Notify::new()),
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Create a job and enqueue its dispatch entry.
    ///
    /// Resubmitting a key that a live job holds returns that job instead.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Submission> {
        for (field, value) in [
            ("tenant_id", &req.tenant_id),
            ("workflow_id", &req.workflow_id),
            ("idempotency_key", &req.idempotency_key),
        ] {
            if value.trim().is_empty() {
                return Err(DispatchError::InvalidRequest(format!("{field} must not be empty")));
            }
        }

        let provider = self.route(&req).await?;
        let priority = req.priority.unwrap_or(self.config.default_priority);
        let now = Utc::now();

        let job = {
            let mut ledger = self.ledger.write().await;
            let mut job = match ledger.create(&req, now) {
                Ok(job) => job,
                Err(DispatchError::Conflict { existing }) => {
                    let job = ledger
                        .get(&existing)
                        .cloned()
                        .ok_or(DispatchError::JobNotFound(existing))?;
                    tracing::debug!(job_id = %job.id, "Duplicate submission, returning live job");
                    return Ok(Submission::Existing(job));
                }
                Err(e) => return Err(e),
            };

            let mut table = self.table.write().await;
            let entry = match table.insert(&job, &provider, priority, now) {
                Ok(entry) => entry,
                Err(e) => {
                    ledger.rollback(&job.id);
                    tracing::warn!(tenant_id = %req.tenant_id, "Dispatch table full, rejecting job");
                    return Err(e);
                }
            };
            ledger.attach_dispatch(&job.id, entry.id);
            job.provider_job_ref = Some(entry.id);
            job
        };

        tracing::info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            workflow_id = %job.workflow_id,
            priority,
            provider = %provider,
            "Job submitted"
        );
        self.work_available.notify_waiters();
        Ok(Submission::Created(job))
    }

    /// The fleet a submission is dispatched to: the named one, else the
    /// first fleet serving the workflow, else unrouted.
    async fn route(&self, req: &SubmitRequest) -> Result<String> {
        let fleets = self.fleets.read().await;
        let Some(slug) = &req.fleet else {
            return Ok(fleets
                .fleet_for_workflow(&req.workflow_id)
                .map(|f| f.slug().to_string())
                .unwrap_or_else(|| UNROUTED_PROVIDER.to_string()));
        };
        let fleet = fleets
            .get(slug)
            .ok_or_else(|| DispatchError::FleetNotFound(slug.clone()))?;
        if fleet.config.workflow_id != req.workflow_id {
            return Err(DispatchError::InvalidRequest(format!(
                "fleet {slug} does not serve workflow {}",
                req.workflow_id
            )));
        }
        Ok(slug.clone())
    }

    pub async fn get_job(&self, job_id: &Uuid) -> Result<Job> {
        self.ledger
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or(DispatchError::JobNotFound(*job_id))
    }

    pub async fn dispatch_entry_for(&self, job_id: &Uuid) -> Option<DispatchEntry> {
        self.table.read().await.get_by_job(job_id).cloned()
    }

    /// Cancel a job that has not finished. Any live lease on it is voided.
    pub async fn cancel(&self, job_id: &Uuid) -> Result<Job> {
        let mut ledger = self.ledger.write().await;
        let mut table = self.table.write().await;
        ledger.cancel(job_id, Utc::now())?;
        if let Some(entry_id) = table.get_by_job(job_id).map(|e| e.id) {
            table.force_fail(&entry_id, "cancelled");
        }
        tracing::info!(job_id = %job_id, "Job cancelled");
        ledger
            .get(job_id)
            .cloned()
            .ok_or(DispatchError::JobNotFound(*job_id))
    }

    // ========================================================================
    // Workers
    // ========================================================================

    pub async fn register(
        &self,
        fleet: &str,
        capabilities: Vec<String>,
        max_concurrency: usize,
    ) -> Result<Registration> {
        if !self.fleets.read().await.contains(fleet) {
            return Err(DispatchError::FleetNotFound(fleet.to_string()));
        }
        self.workers
            .write()
            .await
            .register(fleet, capabilities, max_concurrency, Utc::now())
    }

    pub async fn approve(&self, worker_id: &Uuid) -> Result<()> {
        self.workers.write().await.approve(worker_id)?;
        self.work_available.notify_waiters();
        Ok(())
    }

    /// Operator-initiated drain: no new leases, in-flight work continues.
    pub async fn drain(&self, worker_id: &Uuid, reason: &str) -> Result<()> {
        self.workers.write().await.set_draining(worker_id, reason)
    }

    /// Worker-initiated drain, e.g. on a spot interruption notice.
    pub async fn drain_ack(
        &self,
        creds: &WorkerCredentials,
        reason: &str,
        abandon_in_flight: bool,
    ) -> Result<DrainAck> {
        {
            let mut workers = self.workers.write().await;
            workers.authenticate(&creds.worker_id, &creds.token)?;
            workers.set_draining(&creds.worker_id, reason)?;
            workers.touch(&creds.worker_id, Utc::now());
        }

        let now = Utc::now();
        let mut ledger = self.ledger.write().await;
        let mut table = self.table.write().await;
        let held: Vec<(Uuid, Uuid, Option<LeaseToken>)> = table
            .leases_held_by(&creds.worker_id, now)
            .into_iter()
            .map(|e| (e.id, e.job_id, e.lease_token))
            .collect();

        let mut abandoned = 0;
        if abandon_in_flight {
            for (entry_id, job_id, token) in &held {
                let Some(token) = token else { continue };
                if table.abandon(entry_id, &creds.worker_id, token, now).is_ok() {
                    if let Err(e) = ledger.requeue(job_id) {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to requeue drained job");
                    }
                    abandoned += 1;
                }
            }
        }
        drop(table);
        drop(ledger);

        if abandoned > 0 {
            self.work_available.notify_waiters();
        }
        tracing::info!(
            worker_id = %creds.worker_id,
            abandoned,
            in_flight = held.len() - abandoned,
            reason,
            "Worker acknowledged drain"
        );
        Ok(DrainAck {
            worker_id: creds.worker_id,
            abandoned,
            in_flight: held.len() - abandoned,
        })
    }

    pub async fn list_workers(&self) -> Vec<WorkerView> {
        let now = Utc::now();
        let table = self.table.read().await;
        let workers = self.workers.read().await;
        let loads = table.loads(now);
        workers
            .all_workers()
            .into_iter()
            .map(|w| WorkerView {
                load: loads.get(&w.id).copied().unwrap_or(0),
                alive: w.is_alive(now, workers.dead_after()),
                worker: w.clone(),
            })
            .collect()
    }

    async fn authenticate(&self, creds: &WorkerCredentials) -> Result<Worker> {
        self.workers
            .read()
            .await
            .authenticate(&creds.worker_id, &creds.token)
            .cloned()
    }

    async fn touch(&self, worker_id: &Uuid, now: DateTime<Utc>) {
        self.workers.write().await.touch(worker_id, now);
    }

    // ========================================================================
    // Lease protocol
    // ========================================================================

    /// Lease up to `max_batch` entries, long-polling up to `wait_ms` when
    /// nothing is claimable.
    pub async fn claim(&self, creds: &WorkerCredentials, req: &ClaimRequest) -> Result<Vec<Lease>> {
        let wait = Duration::from_millis(req.wait_ms).min(self.config.max_claim_wait);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let leases = self.try_claim(creds, req).await?;
            if !leases.is_empty() {
                return Ok(leases);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Entries in retry backoff become claimable without a wakeup.
            let _ = tokio::time::timeout_at(deadline.min(now + CLAIM_RECHECK), notified).await;
        }
    }

    async fn try_claim(&self, creds: &WorkerCredentials, req: &ClaimRequest) -> Result<Vec<Lease>> {
        let now = Utc::now();
        let worker = {
            let mut workers = self.workers.write().await;
            workers.authenticate(&creds.worker_id, &creds.token)?;
            workers.touch(&creds.worker_id, now);
            workers
                .get(&creds.worker_id)
                .cloned()
                .ok_or(DispatchError::WorkerNotFound(creds.worker_id))?
        };
        if let Some(reason) = worker.lease_block_reason(now, self.config.dead_worker_after) {
            return Err(DispatchError::WorkerUnavailable {
                reason: reason.to_string(),
            });
        }

        let workflows: HashSet<String> = if req.capabilities.is_empty() {
            worker.capabilities.iter().cloned().collect()
        } else {
            req.capabilities
                .iter()
                .filter(|c| worker.capabilities.contains(*c))
                .cloned()
                .collect()
        };
        if workflows.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self
            .table
            .read()
            .await
            .claim_candidates(&worker.fleet, &workflows, now);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let expires_at = now + to_chrono(self.config.lease_duration());
        let mut leased = Vec::new();
        {
            let mut ledger = self.ledger.write().await;
            let mut table = self.table.write().await;
            // Load is read under the write lock so concurrent claims from one
            // worker cannot each see the same free capacity.
            let load = table.load_of(&worker.id, now);
            let limit = req
                .max_batch
                .max(1)
                .min(self.config.max_claim_batch)
                .min(worker.max_concurrency.saturating_sub(load));
            for candidate in candidates {
                if leased.len() == limit {
                    break;
                }
                let Some(entry) =
                    table.try_lease(candidate, worker.id, LeaseToken::generate(), expires_at, now)
                else {
                    continue;
                };
                if let Err(e) = ledger.mark_dispatched(&entry.job_id, entry.attempts + 1, now) {
                    tracing::warn!(job_id = %entry.job_id, error = %e, "Leased entry has no queued job");
                    table.force_fail(&entry.id, &e.to_string());
                    continue;
                }
                leased.push(entry);
            }
        }

        if !leased.is_empty() {
            let mut waits = self.waits.lock().await;
            for entry in &leased {
                let waited = now.signed_duration_since(entry.enqueued_at);
                waits.record(
                    &entry.provider,
                    waited.num_milliseconds().max(0) as u64,
                    now,
                );
            }
        }

        let leases: Vec<Lease> = leased
            .iter()
            .filter_map(|e| lease_for(e, self.config.heartbeat_interval))
            .collect();
        for lease in &leases {
            tracing::info!(
                dispatch_id = %lease.dispatch_id,
                job_id = %lease.job_id,
                worker_id = %worker.id,
                attempt = lease.attempt,
                "Lease granted"
            );
        }
        Ok(leases)
    }

    /// Extend a lease. The first heartbeat moves the job to `processing`.
    pub async fn heartbeat(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
    ) -> Result<LeaseRenewal> {
        self.authenticate(creds).await?;
        let now = Utc::now();
        let expires_at = now + to_chrono(self.config.lease_duration());

        let renewal = {
            let mut ledger = self.ledger.write().await;
            let mut table = self.table.write().await;
            let renewal = table.renew(dispatch_id, &creds.worker_id, token, expires_at, now)?;
            if renewal.started {
                if let Err(e) = ledger.mark_processing(&renewal.entry.job_id) {
                    tracing::warn!(job_id = %renewal.entry.job_id, error = %e, "Could not mark job processing");
                }
            }
            renewal
        };
        self.touch(&creds.worker_id, now).await;

        tracing::debug!(dispatch_id = %dispatch_id, worker_id = %creds.worker_id, "Lease renewed");
        Ok(LeaseRenewal {
            dispatch_id: renewal.entry.id,
            expires_at,
        })
    }

    /// Report success. Reports against already-terminal jobs are ignored.
    pub async fn complete(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
        result: Value,
    ) -> Result<CompleteOutcome> {
        self.authenticate(creds).await?;
        let now = Utc::now();
        let job_id = {
            let mut ledger = self.ledger.write().await;
            let mut table = self.table.write().await;
            let job_id = table
                .get(dispatch_id)
                .map(|e| e.job_id)
                .ok_or(DispatchError::DispatchNotFound(*dispatch_id))?;
            if ledger.get(&job_id).map_or(true, Job::is_terminal) {
                tracing::debug!(job_id = %job_id, "Ignoring late completion");
                return Ok(CompleteOutcome::Ignored);
            }

            table.release(dispatch_id, &creds.worker_id, token, DispatchStatus::Done, None, now)?;
            ledger.mark_terminal(&job_id, JobStatus::Completed, None, now)?;
            let consumed = result.get("consumed_tokens").and_then(Value::as_u64);
            ledger.record_result(&job_id, result, consumed);
            job_id
        };
        self.touch(&creds.worker_id, now).await;

        tracing::info!(job_id = %job_id, worker_id = %creds.worker_id, "Job completed");
        Ok(CompleteOutcome::Completed)
    }

    /// Report a failed attempt. Retries with backoff until `max_attempts`.
    pub async fn fail(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
        error: &str,
    ) -> Result<FailOutcome> {
        self.authenticate(creds).await?;
        let now = Utc::now();
        let retry = self.config.retry.clone();

        let (job_id, outcome) = {
            let mut ledger = self.ledger.write().await;
            let mut table = self.table.write().await;
            let job_id = table
                .get(dispatch_id)
                .map(|e| e.job_id)
                .ok_or(DispatchError::DispatchNotFound(*dispatch_id))?;
            if ledger.get(&job_id).map_or(true, Job::is_terminal) {
                tracing::debug!(job_id = %job_id, "Ignoring late failure report");
                return Ok(FailOutcome::Ignored);
            }

            let reclaimed = table.fail_attempt(
                dispatch_id,
                &creds.worker_id,
                token,
                error.to_string(),
                self.config.max_attempts,
                |attempts| to_chrono(retry.delay_for(attempts)),
                now,
            )?;
            let attempts = reclaimed.entry.attempts;
            let outcome = if reclaimed.exhausted {
                let message = format!(
                    "{}: {}",
                    DispatchError::MaxAttemptsExceeded { attempts },
                    error
                );
                ledger.mark_terminal(&job_id, JobStatus::Failed, Some(message), now)?;
                FailOutcome::Exhausted { attempts }
            } else {
                ledger.requeue(&job_id)?;
                FailOutcome::Retrying {
                    attempts,
                    retry_at: reclaimed.entry.enqueued_at,
                }
            };
            (job_id, outcome)
        };
        self.touch(&creds.worker_id, now).await;

        match &outcome {
            FailOutcome::Exhausted { attempts } => {
                tracing::warn!(job_id = %job_id, attempts, error, "Job failed permanently")
            }
            FailOutcome::Retrying { attempts, retry_at } => {
                tracing::info!(job_id = %job_id, attempts, retry_at = %retry_at, error, "Job will retry")
            }
            FailOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    /// Hand a lease back without counting an attempt.
    pub async fn abandon(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
    ) -> Result<()> {
        self.authenticate(creds).await?;
        let now = Utc::now();
        {
            let mut ledger = self.ledger.write().await;
            let mut table = self.table.write().await;
            let entry = table.abandon(dispatch_id, &creds.worker_id, token, now)?;
            ledger.requeue(&entry.job_id)?;
            tracing::info!(job_id = %entry.job_id, worker_id = %creds.worker_id, "Lease abandoned");
        }
        self.touch(&creds.worker_id, now).await;
        self.work_available.notify_waiters();
        Ok(())
    }

    // ========================================================================
    // Reaper
    // ========================================================================

    /// Reclaim expired and orphaned leases, expire stale queued jobs and
    /// purge terminal jobs past retention.
    pub async fn reap(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        let dead = self.workers.read().await.dead_workers(now);
        let (candidates, stale) = {
            let table = self.table.read().await;
            let stale = self
                .config
                .queue_ttl
                .map(|ttl| table.stale_pending(now - to_chrono(ttl)))
                .unwrap_or_default();
            (table.reap_candidates(&dead, now), stale)
        };

        {
            let mut ledger = self.ledger.write().await;
            let mut table = self.table.write().await;

            for candidate in candidates {
                let orphaned = table
                    .get(&candidate.id)
                    .and_then(|e| e.worker_id)
                    .is_some_and(|w| dead.contains(&w));
                let reason = if orphaned {
                    "worker stopped heartbeating"
                } else {
                    "lease expired"
                };
                let Some(reclaimed) =
                    table.reclaim(candidate, reason, self.config.max_attempts, now)
                else {
                    continue;
                };

                let entry = &reclaimed.entry;
                let job_result = if reclaimed.exhausted {
                    report.exhausted += 1;
                    let message = format!(
                        "{}: {}",
                        DispatchError::MaxAttemptsExceeded {
                            attempts: entry.attempts
                        },
                        reason
                    );
                    ledger.mark_terminal(&entry.job_id, JobStatus::Failed, Some(message), now)
                } else {
                    report.reclaimed += 1;
                    ledger.requeue(&entry.job_id)
                };
                if let Err(e) = job_result {
                    tracing::warn!(job_id = %entry.job_id, error = %e, "Reclaimed lease for unexpected job state");
                }
                tracing::warn!(
                    dispatch_id = %entry.id,
                    job_id = %entry.job_id,
                    attempts = entry.attempts,
                    exhausted = reclaimed.exhausted,
                    reason,
                    "Lease reclaimed"
                );
            }

            for candidate in stale {
                let expired = table.update_if(&candidate.id, candidate.version, |e| {
                    if e.status != DispatchStatus::Pending {
                        return false;
                    }
                    e.status = DispatchStatus::Failed;
                    e.last_error = Some("expired while queued".to_string());
                    true
                });
                let Some(job_id) = expired.map(|e| e.job_id) else {
                    continue;
                };
                if let Err(e) = ledger.expire(&job_id, now) {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not expire job");
                    continue;
                }
                report.expired += 1;
                tracing::info!(job_id = %job_id, "Queued job expired");
            }

            let purged = ledger.purge_terminal_before(now - to_chrono(self.config.retention));
            for dispatch_id in &purged {
                table.remove(dispatch_id);
            }
            report.purged = purged.len();
        }

        report.pruned_workers = self
            .workers
            .write()
            .await
            .prune_silent(now - to_chrono(self.config.retention));

        if report.reclaimed > 0 {
            self.work_available.notify_waiters();
        }
        report
    }

    // ========================================================================
    // Fleets and metrics
    // ========================================================================

    pub async fn fleet(&self, slug: &str) -> Result<Fleet> {
        self.fleets
            .read()
            .await
            .get(slug)
            .cloned()
            .ok_or_else(|| DispatchError::FleetNotFound(slug.to_string()))
    }

    pub async fn fleets(&self) -> Vec<Fleet> {
        self.fleets.read().await.all().into_iter().cloned().collect()
    }

    pub async fn set_desired(
        &self,
        slug: &str,
        desired: u32,
        source: ScaleSource,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.fleets
            .write()
            .await
            .set_desired(slug, desired, source, reason, now)
    }

    /// Per-fleet counters for the autoscaler, read under one set of locks.
    pub async fn fleet_snapshot(&self, now: DateTime<Utc>) -> Vec<FleetSnapshot> {
        let table = self.table.read().await;
        let workers = self.workers.read().await;
        let fleets = self.fleets.read().await;
        let mut waits = self.waits.lock().await;

        fleets
            .all()
            .into_iter()
            .map(|fleet| {
                let slug = fleet.slug();
                FleetSnapshot {
                    queue_depth: table.pending_count(slug),
                    in_flight: table.in_flight_count(slug),
                    running_workers: workers.running_in_fleet(slug, now),
                    p95_wait_ms: waits.p95(slug, now),
                    last_enqueued_at: table.last_enqueued_at(slug),
                    fleet: fleet.clone(),
                }
            })
            .collect()
    }

    pub async fn stats(&self) -> DispatcherStats {
        let now = Utc::now();
        let ledger = self.ledger.read().await;
        let table = self.table.read().await;
        let workers = self.workers.read().await;

        let jobs = [
            JobStatus::Queued,
            JobStatus::Dispatched,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Expired,
        ]
        .into_iter()
        .map(|status| (status, ledger.count_by_status(status)))
        .collect();

        DispatcherStats {
            jobs,
            dispatch_entries: table.len(),
            workers: workers.len(),
            live_leases: table.loads(now).values().sum(),
        }
    }
}
