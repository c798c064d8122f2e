use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use super::{
    ClaimResponse, CompleteRequest, DesiredCapacityRequest, DrainRequest, FailRequest, FleetStatus,
    LeaseRef, MetricsResponse, RegisterRequest, RegisterResponse,
};
use crate::autoscale::Fleet;
use crate::error::{DispatchError, Result};
use crate::scheduler::dispatcher::WorkerView;
use crate::scheduler::{
    ClaimRequest, CompleteOutcome, DrainAck, FailOutcome, Job, Lease, LeaseRenewal, LeaseToken,
    SubmitRequest, Submission, WorkerCredentials,
};
use crate::worker::LeaseProtocol;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn transport(err: reqwest::Error) -> DispatchError {
    DispatchError::Transport(err.to_string())
}

/// Typed HTTP client for the dispatch API.
#[derive(Debug, Clone)]
pub struct DispatchClient {
    base_url: String,
    http: reqwest::Client,
    admin_token: Option<String>,
}

impl DispatchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(base_url, reqwest::Client::new())
    }

    pub fn with_http(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http,
            admin_token: None,
        }
    }

    /// Token sent on operator calls (drain, approve, desired capacity).
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    async fn send(request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(transport)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        Err(serde_json::from_str::<DispatchError>(&body)
            .unwrap_or_else(|_| DispatchError::Transport(format!("HTTP {status}: {body}"))))
    }

    async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
        Self::send(request).await?.json::<T>().await.map_err(transport)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path)).timeout(REQUEST_TIMEOUT)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path)).timeout(REQUEST_TIMEOUT)
    }

    fn operator(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.admin_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn worker_post(&self, creds: &WorkerCredentials, action: &str) -> RequestBuilder {
        self.post(&format!("/workers/{}/{action}", creds.worker_id))
            .bearer_auth(&creds.token)
    }

    // ========================================================================
    // Tenant
    // ========================================================================

    pub async fn submit(&self, req: &SubmitRequest) -> Result<Submission> {
        let response = Self::send(self.post("/jobs").json(req)).await?;
        let created = response.status() == StatusCode::CREATED;
        let job: Job = response.json().await.map_err(transport)?;
        Ok(if created {
            Submission::Created(job)
        } else {
            Submission::Existing(job)
        })
    }

    pub async fn job(&self, job_id: &Uuid) -> Result<Job> {
        Self::json(self.get(&format!("/jobs/{job_id}"))).await
    }

    pub async fn cancel(&self, job_id: &Uuid) -> Result<Job> {
        Self::json(self.post(&format!("/jobs/{job_id}/cancel"))).await
    }

    // ========================================================================
    // Operator
    // ========================================================================

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        Self::json(self.post("/workers/register").json(req)).await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerView>> {
        Self::json(self.get("/workers")).await
    }

    pub async fn drain(&self, worker_id: &Uuid, reason: &str) -> Result<()> {
        let body = DrainRequest {
            reason: reason.to_string(),
            abandon_in_flight: false,
        };
        Self::send(self.operator(self.post(&format!("/workers/{worker_id}/drain")).json(&body))).await?;
        Ok(())
    }

    pub async fn approve(&self, worker_id: &Uuid) -> Result<()> {
        Self::send(self.operator(self.post(&format!("/workers/{worker_id}/approve")))).await?;
        Ok(())
    }

    pub async fn fleets(&self) -> Result<Vec<Fleet>> {
        Self::json(self.get("/fleets")).await
    }

    pub async fn fleet(&self, slug: &str) -> Result<FleetStatus> {
        Self::json(self.get(&format!("/fleets/{slug}"))).await
    }

    pub async fn set_desired(&self, slug: &str, desired: u32, reason: &str) -> Result<Fleet> {
        let body = DesiredCapacityRequest {
            desired,
            reason: reason.to_string(),
        };
        let request = self
            .http
            .put(self.url(&format!("/fleets/{slug}/desired")))
            .timeout(REQUEST_TIMEOUT)
            .json(&body);
        Self::json(self.operator(request)).await
    }

    pub async fn metrics(&self) -> Result<MetricsResponse> {
        Self::json(self.get("/metrics")).await
    }
}

#[async_trait]
impl LeaseProtocol for DispatchClient {
    async fn claim(&self, creds: &WorkerCredentials, req: &ClaimRequest) -> Result<Vec<Lease>> {
        // Long-polls need to outlive the server-side wait.
        let timeout = REQUEST_TIMEOUT + Duration::from_millis(req.wait_ms);
        let response: ClaimResponse =
            Self::json(self.worker_post(creds, "claim").timeout(timeout).json(req)).await?;
        Ok(response.leases)
    }

    async fn heartbeat(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
    ) -> Result<LeaseRenewal> {
        let body = LeaseRef {
            dispatch_id: *dispatch_id,
            lease_token: *token,
        };
        Self::json(self.worker_post(creds, "heartbeat").json(&body)).await
    }

    async fn complete(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
        result: Value,
    ) -> Result<CompleteOutcome> {
        let body = CompleteRequest {
            dispatch_id: *dispatch_id,
            lease_token: *token,
            result,
        };
        Self::json(self.worker_post(creds, "complete").json(&body)).await
    }

    async fn fail(
        &self,
        creds: &WorkerCredentials,
        dispatch_id: &Uuid,
        token: &LeaseToken,
        error: &str,
    ) -> Result<FailOutcome> {
        let body = FailRequest {
            dispatch_id: *dispatch_id,
            lease_token: *token,
            error: error.to_string(),
        };
        Self::json(self.worker_post(creds, "fail").json(&body)).await
    }

    async fn abandon(&self, creds: &WorkerCredentials, dispatch_id: &Uuid, token: &LeaseToken) -> Result<()> {
        let body = LeaseRef {
            dispatch_id: *dispatch_id,
            lease_token: *token,
        };
        Self::send(self.worker_post(creds, "abandon").json(&body)).await?;
        Ok(())
    }

    async fn drain_ack(
        &self,
        creds: &WorkerCredentials,
        reason: &str,
        abandon_in_flight: bool,
    ) -> Result<DrainAck> {
        let body = DrainRequest {
            reason: reason.to_string(),
            abandon_in_flight,
        };
        Self::json(self.worker_post(creds, "drain-ack").json(&body)).await
    }
}
