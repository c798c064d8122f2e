use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{DispatchError, Result};
use crate::scheduler::{ClaimRequest, Lease, WorkerCredentials};
use crate::worker::executor::{ExecutionResult, WorkflowExecutor};
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::protocol::LeaseProtocol;

const REPORT_ATTEMPTS: u32 = 3;

/// Knobs for a [`WorkerAgent`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Workflows to claim for; empty claims for every registered capability.
    pub capabilities: Vec<String>,
    pub max_concurrency: usize,
    /// Long-poll budget per claim.
    pub claim_wait: Duration,
    /// First delay after a failed claim; doubles up to `max_backoff`.
    pub error_backoff: Duration,
    pub max_backoff: Duration,
    /// On shutdown, hand every lease back at once instead of finishing it.
    pub abandon_on_shutdown: bool,
    /// How long in-flight work may keep running after shutdown before it
    /// is abandoned.
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            max_concurrency: 1,
            claim_wait: Duration::from_secs(20),
            error_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            abandon_on_shutdown: false,
            shutdown_grace: Duration::from_secs(300),
        }
    }
}

impl AgentConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_claim_wait(mut self, wait: Duration) -> Self {
        self.claim_wait = wait;
        self
    }

    pub fn with_abandon_on_shutdown(mut self, abandon: bool) -> Self {
        self.abandon_on_shutdown = abandon;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Pulls leases and runs them, heartbeating each one while it executes.
///
/// The agent never assumes it still owns a job: a heartbeat that comes back
/// with anything but success stops the work and drops the result.
pub struct WorkerAgent<P: ?Sized, E> {
    protocol: Arc<P>,
    executor: Arc<E>,
    creds: WorkerCredentials,
    config: AgentConfig,
}

/// Per-lease cancellation: `abort` drops work the server already took back,
/// `hand_back` asks the task to abandon the lease itself.
#[derive(Clone)]
struct LeaseStops {
    abort: CancellationToken,
    hand_back: CancellationToken,
}

impl<P, E> WorkerAgent<P, E>
where
    P: LeaseProtocol + ?Sized + 'static,
    E: WorkflowExecutor,
{
    pub fn new(protocol: Arc<P>, executor: Arc<E>, creds: WorkerCredentials, config: AgentConfig) -> Self {
        Self {
            protocol,
            executor,
            creds,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let tracker = TaskTracker::new();
        let stops = LeaseStops {
            abort: CancellationToken::new(),
            hand_back: CancellationToken::new(),
        };
        let mut backoff = self.config.error_backoff;

        tracing::info!(
            worker_id = %self.creds.worker_id,
            max_concurrency = self.config.max_concurrency,
            "Worker agent started"
        );

        loop {
            let free = permits.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = permits.acquire() => continue,
                }
            }

            let req = ClaimRequest {
                capabilities: self.config.capabilities.clone(),
                max_batch: free,
                wait_ms: self.config.claim_wait.as_millis() as u64,
            };
            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                claimed = self.protocol.claim(&self.creds, &req) => claimed,
            };

            match claimed {
                Ok(leases) => {
                    backoff = self.config.error_backoff;
                    for lease in leases {
                        let Ok(permit) = permits.clone().try_acquire_owned() else {
                            // More leases than free slots; hand the extra back.
                            self.hand_back(&lease).await;
                            continue;
                        };
                        tracker.spawn(run_lease(
                            self.protocol.clone(),
                            self.executor.clone(),
                            self.creds.clone(),
                            lease,
                            stops.clone(),
                            permit,
                        ));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.creds.worker_id,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Claim failed"
                    );
                    if matches!(e, DispatchError::Unauthorized | DispatchError::WorkerNotFound(_)) {
                        tracker.close();
                        tracker.wait().await;
                        return Err(e);
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }

        self.shut_down(tracker, stops).await;
        Ok(())
    }

    async fn hand_back(&self, lease: &Lease) {
        if let Err(e) = self
            .protocol
            .abandon(&self.creds, &lease.dispatch_id, &lease.token)
            .await
        {
            tracing::warn!(dispatch_id = %lease.dispatch_id, error = %e, "Failed to hand back lease");
        }
    }

    async fn shut_down(&self, tracker: TaskTracker, stops: LeaseStops) {
        tracker.close();
        let in_flight = tracker.len();
        tracing::info!(
            worker_id = %self.creds.worker_id,
            in_flight,
            abandon = self.config.abandon_on_shutdown,
            "Worker agent draining"
        );

        match self
            .protocol
            .drain_ack(&self.creds, "worker shutting down", self.config.abandon_on_shutdown)
            .await
        {
            Ok(ack) => {
                tracing::info!(abandoned = ack.abandoned, in_flight = ack.in_flight, "Drain acknowledged")
            }
            Err(e) => tracing::warn!(error = %e, "Drain acknowledgement failed"),
        }

        if self.config.abandon_on_shutdown {
            stops.abort.cancel();
        } else if tokio::time::timeout(self.config.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Shutdown grace elapsed, abandoning remaining leases");
            stops.hand_back.cancel();
        }
        tracker.wait().await;
        tracing::info!(worker_id = %self.creds.worker_id, "Worker agent stopped");
    }
}

async fn run_lease<P, E>(
    protocol: Arc<P>,
    executor: Arc<E>,
    creds: WorkerCredentials,
    lease: Lease,
    stops: LeaseStops,
    _permit: OwnedSemaphorePermit,
) where
    P: LeaseProtocol + ?Sized,
    E: WorkflowExecutor,
{
    let heartbeat = HeartbeatSender::new(lease.heartbeat_interval_ms);

    let result = tokio::select! {
        lost = heartbeat.run(protocol.as_ref(), &creds, &lease.dispatch_id, &lease.token) => {
            tracing::warn!(
                dispatch_id = %lease.dispatch_id,
                job_id = %lease.job_id,
                error = %lost,
                "Lease lost, dropping work"
            );
            return;
        }
        _ = stops.abort.cancelled() => return,
        _ = stops.hand_back.cancelled() => {
            if let Err(e) = protocol.abandon(&creds, &lease.dispatch_id, &lease.token).await {
                tracing::warn!(dispatch_id = %lease.dispatch_id, error = %e, "Abandon failed");
            }
            return;
        }
        result = executor.execute(&lease) => result,
    };

    report(protocol.as_ref(), &creds, &lease, result).await;
}

async fn report<P>(protocol: &P, creds: &WorkerCredentials, lease: &Lease, result: ExecutionResult)
where
    P: LeaseProtocol + ?Sized,
{
    for attempt in 1..=REPORT_ATTEMPTS {
        let outcome = match &result {
            ExecutionResult::Succeeded(value) => protocol
                .complete(creds, &lease.dispatch_id, &lease.token, value.clone())
                .await
                .map(|o| format!("{o:?}")),
            ExecutionResult::Failed(error) => protocol
                .fail(creds, &lease.dispatch_id, &lease.token, error)
                .await
                .map(|o| format!("{o:?}")),
        };

        match outcome {
            Ok(outcome) => {
                tracing::info!(
                    dispatch_id = %lease.dispatch_id,
                    job_id = %lease.job_id,
                    succeeded = matches!(result, ExecutionResult::Succeeded(_)),
                    outcome,
                    "Result reported"
                );
                return;
            }
            Err(DispatchError::Transport(e)) if attempt < REPORT_ATTEMPTS => {
                tracing::warn!(dispatch_id = %lease.dispatch_id, error = %e, attempt, "Report failed, retrying");
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            Err(e) => {
                // The lease is gone; the reaper or another worker owns the job now.
                tracing::warn!(dispatch_id = %lease.dispatch_id, error = %e, "Result rejected");
                return;
            }
        }
    }
}

