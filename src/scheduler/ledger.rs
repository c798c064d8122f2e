use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobStatus, SubmitRequest};

/// Idempotency keys are scoped to a tenant and workflow.
type IdempotencyKey = (String, String, String);

/// Durable record of submitted jobs and their lifecycle.
///
/// Owns job identity and every status transition. Transitions only move
/// forward once a job is terminal; the dispatch layer drives the
/// non-terminal ones (`queued <-> dispatched -> processing`).
#[derive(Debug, Default)]
pub struct JobLedger {
    jobs: HashMap<Uuid, Job>,
    by_key: HashMap<IdempotencyKey, Uuid>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queued job, or fail with `Conflict` if a non-terminal job
    /// already holds the idempotency key.
    pub fn create(&mut self, req: &SubmitRequest, now: DateTime<Utc>) -> Result<Job> {
        let key = (
            req.tenant_id.clone(),
            req.workflow_id.clone(),
            req.idempotency_key.clone(),
        );
        if let Some(existing) = self.by_key.get(&key).and_then(|id| self.jobs.get(id)) {
            if !existing.is_terminal() {
                return Err(DispatchError::Conflict {
                    existing: existing.id,
                });
            }
        }

        let job = Job::new(req, now);
        self.by_key.insert(key, job.id);
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    /// Undo a `create` whose dispatch insert failed.
    pub fn rollback(&mut self, job_id: &Uuid) {
        if let Some(job) = self.jobs.remove(job_id) {
            let key = (job.tenant_id, job.workflow_id, job.idempotency_key);
            if self.by_key.get(&key) == Some(job_id) {
                self.by_key.remove(&key);
            }
        }
    }

    pub fn attach_dispatch(&mut self, job_id: &Uuid, dispatch_id: Uuid) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.provider_job_ref = Some(dispatch_id);
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn find_by_key(&self, tenant_id: &str, workflow_id: &str, key: &str) -> Option<&Job> {
        let key = (
            tenant_id.to_string(),
            workflow_id.to_string(),
            key.to_string(),
        );
        self.by_key.get(&key).and_then(|id| self.jobs.get(id))
    }

    fn get_mut(&mut self, id: &Uuid) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or(DispatchError::JobNotFound(*id))
    }

    /// `queued -> dispatched` when a lease is granted.
    pub fn mark_dispatched(&mut self, id: &Uuid, attempt: u32, now: DateTime<Utc>) -> Result<()> {
        let job = self.get_mut(id)?;
        if job.status != JobStatus::Queued {
            return Err(DispatchError::InvalidTransition {
                job_id: *id,
                from: job.status,
                to: JobStatus::Dispatched,
            });
        }
        job.status = JobStatus::Dispatched;
        job.attempt_count = attempt;
        job.reserved_tokens = job.requested_tokens;
        job.started_at.get_or_insert(now);
        Ok(())
    }

    /// `dispatched -> processing` on the first heartbeat of a lease.
    pub fn mark_processing(&mut self, id: &Uuid) -> Result<()> {
        let job = self.get_mut(id)?;
        match job.status {
            JobStatus::Processing => Ok(()),
            JobStatus::Dispatched => {
                job.status = JobStatus::Processing;
                Ok(())
            }
            from => Err(DispatchError::InvalidTransition {
                job_id: *id,
                from,
                to: JobStatus::Processing,
            }),
        }
    }

    /// Put an in-flight job back in the queue after its lease was lost.
    pub fn requeue(&mut self, id: &Uuid) -> Result<()> {
        let job = self.get_mut(id)?;
        match job.status {
            JobStatus::Dispatched | JobStatus::Processing => {
                job.status = JobStatus::Queued;
                job.reserved_tokens = None;
                Ok(())
            }
            JobStatus::Queued => Ok(()),
            from => Err(DispatchError::InvalidTransition {
                job_id: *id,
                from,
                to: JobStatus::Queued,
            }),
        }
    }

    /// Terminal transition reported through the lease protocol.
    ///
    /// Only `dispatched` and `processing` jobs can finish this way.
    pub fn mark_terminal(
        &mut self,
        id: &Uuid,
        status: JobStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = self.get_mut(id)?;
        let allowed_source = matches!(job.status, JobStatus::Dispatched | JobStatus::Processing);
        if !allowed_source || !matches!(status, JobStatus::Completed | JobStatus::Failed) {
            return Err(DispatchError::InvalidTransition {
                job_id: *id,
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        job.error_message = error_message;
        job.completed_at = Some(now);
        Ok(())
    }

    pub fn record_result(&mut self, id: &Uuid, result: Value, consumed_tokens: Option<u64>) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.consumed_tokens = consumed_tokens.or(job.consumed_tokens);
            job.result = Some(result);
        }
    }

    /// Cancel a job that has not finished yet.
    pub fn cancel(&mut self, id: &Uuid, now: DateTime<Utc>) -> Result<()> {
        let job = self.get_mut(id)?;
        if job.is_terminal() {
            return Err(DispatchError::InvalidTransition {
                job_id: *id,
                from: job.status,
                to: JobStatus::Failed,
            });
        }
        job.status = JobStatus::Failed;
        job.error_message = Some("cancelled".to_string());
        job.completed_at = Some(now);
        Ok(())
    }

    /// `queued -> expired` when the job sat in the queue past its TTL.
    pub fn expire(&mut self, id: &Uuid, now: DateTime<Utc>) -> Result<()> {
        let job = self.get_mut(id)?;
        if job.status != JobStatus::Queued {
            return Err(DispatchError::InvalidTransition {
                job_id: *id,
                from: job.status,
                to: JobStatus::Expired,
            });
        }
        job.status = JobStatus::Expired;
        job.error_message = Some("expired while queued".to_string());
        job.completed_at = Some(now);
        Ok(())
    }

    /// Remove terminal jobs that finished before `cutoff`. Returns the ids
    /// of the dispatch entries that backed them.
    pub fn purge_terminal_before(&mut self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id)
            .collect();

        let mut dispatch_ids = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(job) = self.jobs.remove(&id) {
                let key = (job.tenant_id, job.workflow_id, job.idempotency_key);
                if self.by_key.get(&key) == Some(&id) {
                    self.by_key.remove(&key);
                }
                dispatch_ids.extend(job.provider_job_ref);
            }
        }
        dispatch_ids
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|j| j.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn request(key: &str) -> SubmitRequest {
        SubmitRequest::new("tenant-a", "sdxl", key, json!({"prompt": "a cat"}))
    }

    #[test]
    fn create_rejects_live_duplicate_key() {
        let mut ledger = JobLedger::new();
        let now = Utc::now();
        let job = ledger.create(&request("k1"), now).unwrap();

        let err = ledger.create(&request("k1"), now).unwrap_err();
        assert_eq!(err, DispatchError::Conflict { existing: job.id });
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn same_key_in_other_tenant_is_independent() {
        let mut ledger = JobLedger::new();
        let now = Utc::now();
        ledger.create(&request("k1"), now).unwrap();

        let mut other = request("k1");
        other.tenant_id = "tenant-b".to_string();
        assert!(ledger.create(&other, now).is_ok());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn terminal_job_frees_its_key() {
        let mut ledger = JobLedger::new();
        let now = Utc::now();
        let first = ledger.create(&request("k1"), now).unwrap();
        ledger.mark_dispatched(&first.id, 1, now).unwrap();
        ledger
            .mark_terminal(&first.id, JobStatus::Completed, None, now)
            .unwrap();

        let second = ledger.create(&request("k1"), now).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(
            ledger.find_by_key("tenant-a", "sdxl", "k1").unwrap().id,
            second.id
        );
    }

    #[test]
    fn rollback_removes_job_and_key() {
        let mut ledger = JobLedger::new();
        let job = ledger.create(&request("k1"), Utc::now()).unwrap();
        ledger.rollback(&job.id);

        assert!(ledger.is_empty());
        assert!(ledger.find_by_key("tenant-a", "sdxl", "k1").is_none());
        assert!(ledger.create(&request("k1"), Utc::now()).is_ok());
    }

    #[test]
    fn mark_terminal_requires_in_flight_job() {
        let mut ledger = JobLedger::new();
        let now = Utc::now();
        let job = ledger.create(&request("k1"), now).unwrap();

        let err = ledger
            .mark_terminal(&job.id, JobStatus::Completed, None, now)
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn terminal_jobs_cannot_be_resurrected() {
        let mut ledger = JobLedger::new();
        let now = Utc::now();
        let job = ledger.create(&request("k1"), now).unwrap();
        ledger.mark_dispatched(&job.id, 1, now).unwrap();
        ledger.mark_processing(&job.id).unwrap();
        ledger
            .mark_terminal(&job.id, JobStatus::Failed, Some("boom".into()), now)
            .unwrap();

        assert!(ledger.requeue(&job.id).is_err());
        assert!(ledger.mark_processing(&job.id).is_err());
        assert!(ledger.cancel(&job.id, now).is_err());
        assert!(ledger
            .mark_terminal(&job.id, JobStatus::Completed, None, now)
            .is_err());
        assert_eq!(ledger.get(&job.id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn dispatch_and_requeue_cycle() {
        let mut ledger = JobLedger::new();
        let now = Utc::now();
        let job = ledger
            .create(&request("k1").with_requested_tokens(12), now)
            .unwrap();

        ledger.mark_dispatched(&job.id, 1, now).unwrap();
        let stored = ledger.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Dispatched);
        assert_eq!(stored.reserved_tokens, Some(12));
        assert_eq!(stored.started_at, Some(now));

        ledger.requeue(&job.id).unwrap();
        let stored = ledger.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.reserved_tokens, None);

        ledger.mark_dispatched(&job.id, 2, now).unwrap();
        assert_eq!(ledger.get(&job.id).unwrap().attempt_count, 2);
    }

    #[test]
    fn expire_only_from_queued() {
        let mut ledger = JobLedger::new();
        let now = Utc::now();
        let queued = ledger.create(&request("k1"), now).unwrap();
        let dispatched = ledger.create(&request("k2"), now).unwrap();
        ledger.mark_dispatched(&dispatched.id, 1, now).unwrap();

        ledger.expire(&queued.id, now).unwrap();
        assert_eq!(ledger.get(&queued.id).unwrap().status, JobStatus::Expired);
        assert!(ledger.expire(&dispatched.id, now).is_err());
    }

    #[test]
    fn purge_removes_only_old_terminal_jobs() {
        let mut ledger = JobLedger::new();
        let now = Utc::now();
        let old = ledger.create(&request("old"), now).unwrap();
        let dispatch_id = Uuid::new_v4();
        ledger.attach_dispatch(&old.id, dispatch_id);
        ledger.cancel(&old.id, now - Duration::hours(2)).unwrap();

        let fresh = ledger.create(&request("fresh"), now).unwrap();
        ledger.cancel(&fresh.id, now).unwrap();
        let live = ledger.create(&request("live"), now).unwrap();

        let purged = ledger.purge_terminal_before(now - Duration::hours(1));
        assert_eq!(purged, vec![dispatch_id]);
        assert!(ledger.get(&old.id).is_none());
        assert!(ledger.get(&fresh.id).is_some());
        assert!(ledger.get(&live.id).is_some());
    }
}
