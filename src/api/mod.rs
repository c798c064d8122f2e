//! HTTP surface: tenant job endpoints, the worker lease protocol and the
//! fleet control surface, all JSON over axum.

pub mod client;
mod fleets;
mod jobs;
mod workers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::autoscale::MetricsCollector;
use crate::error::DispatchError;
use crate::scheduler::{Dispatcher, Lease, LeaseToken, WorkerCredentials};

pub use client::DispatchClient;
pub use fleets::{FleetStatus, MetricsResponse};

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
    pub metrics: Arc<MetricsCollector>,
    admin_token: Option<Arc<str>>,
}

impl ApiState {
    pub fn new(dispatcher: Dispatcher, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            dispatcher,
            metrics,
            admin_token: None,
        }
    }

    /// Require `Authorization: Bearer <token>` on operator routes.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(Arc::from(token.into()));
        self
    }

    fn authorize_operator(&self, headers: &HeaderMap) -> ApiResult<()> {
        let Some(expected) = &self.admin_token else {
            return Ok(());
        };
        match bearer(headers) {
            Some(token) if token == &**expected => Ok(()),
            _ => Err(ApiError(DispatchError::Unauthorized)),
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub fleet: String,
    pub capabilities: Vec<String>,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: Uuid,
    /// Bearer token for every later call. Shown once.
    pub token: String,
    pub approved: bool,
    pub heartbeat_interval_ms: u64,
    pub lease_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub leases: Vec<Lease>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRef {
    pub dispatch_id: Uuid,
    pub lease_token: LeaseToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub dispatch_id: Uuid,
    pub lease_token: LeaseToken,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub dispatch_id: Uuid,
    pub lease_token: LeaseToken,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainRequest {
    #[serde(default = "default_drain_reason")]
    pub reason: String,
    /// Only honoured on the worker's own drain acknowledgement.
    #[serde(default)]
    pub abandon_in_flight: bool,
}

fn default_drain_reason() -> String {
    "drain requested".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredCapacityRequest {
    pub desired: u32,
    #[serde(default = "default_operator_reason")]
    pub reason: String,
}

fn default_operator_reason() -> String {
    "operator override".to_string()
}

// ============================================================================
// Errors
// ============================================================================

/// [`DispatchError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::Conflict { .. }
        | DispatchError::LeaseMismatch { .. }
        | DispatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
        DispatchError::MaxAttemptsExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::CapacityExhausted { .. } | DispatchError::QueueFull => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DispatchError::JobNotFound(_)
        | DispatchError::DispatchNotFound(_)
        | DispatchError::WorkerNotFound(_)
        | DispatchError::FleetNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
        DispatchError::WorkerUnavailable { .. } => StatusCode::FORBIDDEN,
        DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DispatchError::Transport(_) => StatusCode::BAD_GATEWAY,
        DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, kind = self.0.kind(), "Request rejected");
        }

        let mut body = serde_json::to_value(&self.0)
            .unwrap_or_else(|_| serde_json::json!({ "error": self.0.kind() }));
        if let Value::Object(map) = &mut body {
            map.insert("message".to_string(), Value::String(self.0.to_string()));
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Worker credentials from the path id and the `Authorization: Bearer` header.
fn credentials(worker_id: Uuid, headers: &HeaderMap) -> ApiResult<WorkerCredentials> {
    let token = bearer(headers).ok_or(ApiError(DispatchError::Unauthorized))?;
    Ok(WorkerCredentials::new(worker_id, token))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/jobs", post(jobs::submit))
        .route("/jobs/:id", get(jobs::get))
        .route("/jobs/:id/cancel", post(jobs::cancel))
        .route("/workers", get(workers::list))
        .route("/workers/register", post(workers::register))
        .route("/workers/:id/claim", post(workers::claim))
        .route("/workers/:id/heartbeat", post(workers::heartbeat))
        .route("/workers/:id/complete", post(workers::complete))
        .route("/workers/:id/fail", post(workers::fail))
        .route("/workers/:id/abandon", post(workers::abandon))
        .route("/workers/:id/drain-ack", post(workers::drain_ack))
        .route("/workers/:id/drain", post(workers::drain))
        .route("/workers/:id/approve", post(workers::approve))
        .route("/fleets", get(fleets::list))
        .route("/fleets/:slug", get(fleets::get))
        .route("/fleets/:slug/desired", put(fleets::set_desired))
        .route("/metrics", get(fleets::metrics));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve the API until `shutdown` fires.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Dispatch API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
