use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::JobStatus;

/// Every failure the dispatcher can report.
///
/// Serializes as `{"error": <kind>, "detail": ...}` so HTTP clients get the
/// same typed error back.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum DispatchError {
    /// A non-terminal job already owns the idempotency key.
    #[error("Job {existing} already exists for this idempotency key")]
    Conflict { existing: Uuid },

    #[error("Lease mismatch on dispatch entry {dispatch_id}")]
    LeaseMismatch { dispatch_id: Uuid },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Max attempts exceeded after {attempts} attempts")]
    MaxAttemptsExceeded { attempts: u32 },

    #[error("Fleet {fleet} is at max size {max_size}")]
    CapacityExhausted { fleet: String, max_size: u32 },

    #[error("Dispatch table is at capacity")]
    QueueFull,

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Dispatch entry not found: {0}")]
    DispatchNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(Uuid),

    #[error("Fleet not found: {0}")]
    FleetNotFound(String),

    #[error("Invalid worker credentials")]
    Unauthorized,

    #[error("Worker cannot take leases: {reason}")]
    WorkerUnavailable { reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The dispatcher could not be reached or answered garbage.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Expected outcomes under races or flaky links; the worker retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::LeaseMismatch { .. } | DispatchError::Transport(_)
        )
    }

    /// Stable machine-readable name, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Conflict { .. } => "conflict",
            DispatchError::LeaseMismatch { .. } => "lease_mismatch",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::MaxAttemptsExceeded { .. } => "max_attempts_exceeded",
            DispatchError::CapacityExhausted { .. } => "capacity_exhausted",
            DispatchError::QueueFull => "queue_full",
            DispatchError::JobNotFound(_) => "job_not_found",
            DispatchError::DispatchNotFound(_) => "dispatch_not_found",
            DispatchError::WorkerNotFound(_) => "worker_not_found",
            DispatchError::FleetNotFound(_) => "fleet_not_found",
            DispatchError::Unauthorized => "unauthorized",
            DispatchError::WorkerUnavailable { .. } => "worker_unavailable",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Transport(_) => "transport",
            DispatchError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
