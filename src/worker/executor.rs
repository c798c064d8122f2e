use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::scheduler::Lease;

/// Outcome of running one leased job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Succeeded(Value),
    Failed(String),
}

/// Runs the workflow behind a lease. Implementations must be cancel-safe:
/// the agent drops the future when the lease is lost.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync + 'static {
    async fn execute(&self, lease: &Lease) -> ExecutionResult;
}

/// Runs `payload.command` through `sh -c`.
///
/// The workflow id and the raw payload are exported as `WORKFLOW_ID` and
/// `JOB_PAYLOAD`. Stdout becomes the job result; a non-zero exit is a failed
/// attempt carrying stderr.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    shell: Option<String>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    fn process_output(lease: &Lease, result: std::io::Result<std::process::Output>) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                let exit_code = output.status.code();

                tracing::info!(
                    job_id = %lease.job_id,
                    dispatch_id = %lease.dispatch_id,
                    exit_code = ?exit_code,
                    "Workflow process exited"
                );

                if output.status.success() {
                    ExecutionResult::Succeeded(json!({
                        "exit_code": exit_code,
                        "stdout": stdout,
                    }))
                } else if stderr.is_empty() {
                    ExecutionResult::Failed(format!("Exit code: {:?}", exit_code))
                } else {
                    ExecutionResult::Failed(stderr)
                }
            }
            Err(e) => {
                tracing::error!(job_id = %lease.job_id, error = %e, "Workflow process failed to start");
                ExecutionResult::Failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl WorkflowExecutor for ShellExecutor {
    async fn execute(&self, lease: &Lease) -> ExecutionResult {
        let Some(command) = lease.payload.get("command").and_then(Value::as_str) else {
            return ExecutionResult::Failed("payload has no `command` string".to_string());
        };
        tracing::info!(job_id = %lease.job_id, workflow_id = %lease.workflow_id, command, "Executing job");

        let result = Command::new(self.shell.as_deref().unwrap_or("sh"))
            .arg("-c")
            .arg(command)
            .env("WORKFLOW_ID", &lease.workflow_id)
            .env("JOB_PAYLOAD", lease.payload.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        Self::process_output(lease, result)
    }
}
