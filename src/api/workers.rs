use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use uuid::Uuid;

use super::{
    credentials, ApiResult, ApiState, ClaimResponse, CompleteRequest, DrainRequest, FailRequest,
    LeaseRef, RegisterRequest, RegisterResponse,
};
use crate::scheduler::dispatcher::WorkerView;
use crate::scheduler::{ClaimRequest, CompleteOutcome, DrainAck, FailOutcome, LeaseRenewal};

pub(super) async fn register(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let registration = state
        .dispatcher
        .register(&req.fleet, req.capabilities, req.max_concurrency)
        .await?;
    let config = state.dispatcher.config();
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            worker_id: registration.worker.id,
            token: registration.token,
            approved: registration.worker.is_approved,
            heartbeat_interval_ms: config.heartbeat_interval.as_millis() as u64,
            lease_duration_ms: config.lease_duration().as_millis() as u64,
        }),
    ))
}

pub(super) async fn list(State(state): State<ApiState>) -> Json<Vec<WorkerView>> {
    Json(state.dispatcher.list_workers().await)
}

pub(super) async fn claim(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Json<ClaimResponse>> {
    let creds = credentials(id, &headers)?;
    let leases = state.dispatcher.claim(&creds, &req).await?;
    Ok(Json(ClaimResponse { leases }))
}

pub(super) async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<LeaseRef>,
) -> ApiResult<Json<LeaseRenewal>> {
    let creds = credentials(id, &headers)?;
    let renewal = state
        .dispatcher
        .heartbeat(&creds, &req.dispatch_id, &req.lease_token)
        .await?;
    Ok(Json(renewal))
}

pub(super) async fn complete(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<Json<CompleteOutcome>> {
    let creds = credentials(id, &headers)?;
    let outcome = state
        .dispatcher
        .complete(&creds, &req.dispatch_id, &req.lease_token, req.result)
        .await?;
    Ok(Json(outcome))
}

pub(super) async fn fail(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<FailRequest>,
) -> ApiResult<Json<FailOutcome>> {
    let creds = credentials(id, &headers)?;
    let outcome = state
        .dispatcher
        .fail(&creds, &req.dispatch_id, &req.lease_token, &req.error)
        .await?;
    Ok(Json(outcome))
}

pub(super) async fn abandon(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<LeaseRef>,
) -> ApiResult<StatusCode> {
    let creds = credentials(id, &headers)?;
    state
        .dispatcher
        .abandon(&creds, &req.dispatch_id, &req.lease_token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn drain_ack(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<DrainRequest>,
) -> ApiResult<Json<DrainAck>> {
    let creds = credentials(id, &headers)?;
    let ack = state
        .dispatcher
        .drain_ack(&creds, &req.reason, req.abandon_in_flight)
        .await?;
    Ok(Json(ack))
}

// Operator endpoints, gated by the admin token when one is configured.

pub(super) async fn drain(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<DrainRequest>,
) -> ApiResult<StatusCode> {
    state.authorize_operator(&headers)?;
    state.dispatcher.drain(&id, &req.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn approve(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    state.authorize_operator(&headers)?;
    state.dispatcher.approve(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
