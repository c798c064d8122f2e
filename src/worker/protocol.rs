use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::{
    ClaimRequest, CompleteOutcome, Dispatcher, DrainAck, FailOutcome, Lease, LeaseRenewal,
    LeaseToken, WorkerCredentials,
};

/// The worker's side of the lease protocol.
///
/// Implemented in-process by [`Dispatcher`] and over HTTP by
/// [`DispatchClient`](crate::api::DispatchClient), so a [`WorkerAgent`]
/// runs the same against either.
///
/// [`WorkerAgent`]: crate::worker::WorkerAgent
#[async_trait]
pub trait LeaseProtocol: Send + Sync {
    async fn claim(&self, creds: &WorkerCredentials, req: &ClaimRequest) -> Result<Vec<Lease>>;

    async fn heartbeat(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
    ) -> Result<LeaseRenewal>;

    async fn complete(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
        result: Value,
    ) -> Result<CompleteOutcome>;

    async fn fail(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
        error: &str,
    ) -> Result<FailOutcome>;

    async fn abandon(&self, creds: &WorkerCredentials, dispatch_id: &Uuid, token: &LeaseToken) -> Result<()>;

    async fn drain_ack(
        &self,
        creds: &WorkerCredentials,
        reason: &str,
        abandon_in_flight: bool,
    ) -> Result<DrainAck>;
}

#[async_trait]
impl LeaseProtocol for Dispatcher {
    async fn claim(&self, creds: &WorkerCredentials, req: &ClaimRequest) -> Result<Vec<Lease>> {
        Dispatcher::claim(self, creds, req).await
    }

    async fn heartbeat(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
    ) -> Result<LeaseRenewal> {
        Dispatcher::heartbeat(self, creds, dispatch_id, token).await
    }

    async fn complete(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
        result: Value,
    ) -> Result<CompleteOutcome> {
        Dispatcher::complete(self, creds, dispatch_id, token, result).await
    }

    async fn fail(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
        error: &str,
    ) -> Result<FailOutcome> {
        Dispatcher::fail(self, creds, dispatch_id, token, error).await
    }

    async fn abandon(&self, creds: &WorkerCredentials, dispatch_id: &Uuid, token: &LeaseToken) -> Result<()> {
        Dispatcher::abandon(self, creds, dispatch_id, token).await
    }

    async fn drain_ack(
        &self,
        creds: &WorkerCredentials,
        reason: &str,
        abandon_in_flight: bool,
    ) -> Result<DrainAck> {
        Dispatcher::drain_ack(self, creds, reason, abandon_in_flight).await
    }
}
