//! Worker side of the lease protocol.
//!
//! A [`WorkerAgent`] claims leases through any [`LeaseProtocol`]
//! implementation, runs each one on a [`WorkflowExecutor`], and keeps it
//! alive with a [`HeartbeatSender`] until the result is reported.
//!
//! # Lease loss
//!
//! When a heartbeat is rejected the agent drops the running work and never
//! reports a result for it; the job has already been handed to someone else.
//!
//! # Security Note
//!
//! [`ShellExecutor`] runs payload commands directly via the shell without
//! sandboxing.

pub mod agent;
pub mod executor;
pub mod heartbeat;
pub mod protocol;

pub use agent::{AgentConfig, WorkerAgent};
pub use executor::{ExecutionResult, ShellExecutor, WorkflowExecutor};
pub use heartbeat::HeartbeatSender;
pub use protocol::LeaseProtocol;
