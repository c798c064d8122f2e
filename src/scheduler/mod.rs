pub mod dispatch;
pub mod dispatcher;
pub mod job;
pub mod ledger;
pub mod reaper;
pub mod registry;

pub use dispatch::{DispatchEntry, DispatchStatus, DispatchTable, LeaseToken, UNROUTED_PROVIDER};
pub use dispatcher::{
    ClaimRequest, CompleteOutcome, Dispatcher, DrainAck, FailOutcome, Lease, LeaseRenewal,
    ReapReport, Submission, WorkerCredentials,
};
pub use job::{Job, JobStatus, SubmitRequest};
pub use ledger::JobLedger;
pub use reaper::Reaper;
pub use registry::{Registration, Worker, WorkerRegistry};
