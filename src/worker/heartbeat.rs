use std::time::Duration;

use uuid::Uuid;

use crate::error::DispatchError;
use crate::scheduler::{LeaseToken, WorkerCredentials};
use crate::worker::protocol::LeaseProtocol;

/// Keeps one lease alive by renewing it at a fixed interval.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Renew until the lease is lost. The first renewal goes out
    /// immediately. Transport errors are retried on the next tick, since the
    /// lease may still be live server-side; anything else ends the lease.
    pub async fn run<P>(
        &self,
        protocol: &P,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
    ) -> DispatchError
    where
        P: LeaseProtocol + ?Sized,
    {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;
            match protocol.heartbeat(creds, dispatch_id, token).await {
                Ok(renewal) => {
                    tracing::trace!(dispatch_id = %dispatch_id, expires_at = %renewal.expires_at, "Heartbeat sent");
                }
                Err(DispatchError::Transport(e)) => {
                    tracing::warn!(dispatch_id = %dispatch_id, error = %e, "Heartbeat failed, retrying");
                }
                Err(e) => return e,
            }
        }
    }
}
