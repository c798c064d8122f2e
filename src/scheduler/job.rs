use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Dispatched,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Expired
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Dispatched => write!(f, "dispatched"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Expired => write!(f, "expired"),
        }
    }
}

/// What a tenant-facing caller hands to `Submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub tenant_id: String,
    pub workflow_id: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub requested_tokens: Option<u64>,
    /// Route to one stage fleet when several serve the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet: Option<String>,
}

impl SubmitRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        workflow_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workflow_id: workflow_id.into(),
            idempotency_key: idempotency_key.into(),
            payload,
            priority: None,
            requested_tokens: None,
            fleet: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_requested_tokens(mut self, tokens: u64) -> Self {
        self.requested_tokens = Some(tokens);
        self
    }

    pub fn with_fleet(mut self, fleet: impl Into<String>) -> Self {
        self.fleet = Some(fleet.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub workflow_id: String,
    pub status: JobStatus,
    pub idempotency_key: String,
    pub attempt_count: u32,
    pub requested_tokens: Option<u64>,
    pub reserved_tokens: Option<u64>,
    pub consumed_tokens: Option<u64>,
    /// Dispatch entry backing this job.
    pub provider_job_ref: Option<Uuid>,
    pub payload: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(req: &SubmitRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: req.tenant_id.clone(),
            workflow_id: req.workflow_id.clone(),
            status: JobStatus::Queued,
            idempotency_key: req.idempotency_key.clone(),
            attempt_count: 0,
            requested_tokens: req.requested_tokens,
            reserved_tokens: None,
            consumed_tokens: None,
            provider_job_ref: None,
            payload: req.payload.clone(),
            result: None,
            error_message: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
