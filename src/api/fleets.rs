use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{ApiResult, ApiState, DesiredCapacityRequest};
use crate::autoscale::{Fleet, FleetMetrics, ScaleSource};
use crate::scheduler::dispatcher::DispatcherStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatus {
    pub fleet: Fleet,
    pub metrics: Option<FleetMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub fleets: Vec<FleetMetrics>,
    pub dispatcher: DispatcherStats,
}

pub(super) async fn list(State(state): State<ApiState>) -> Json<Vec<Fleet>> {
    Json(state.dispatcher.fleets().await)
}

pub(super) async fn get(
    State(state): State<ApiState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<FleetStatus>> {
    let fleet = state.dispatcher.fleet(&slug).await?;
    let metrics = state
        .metrics
        .collect(Utc::now())
        .await
        .into_iter()
        .find(|m| m.fleet == slug);
    Ok(Json(FleetStatus { fleet, metrics }))
}

/// Operator override; counts as a fresh scaling change for warm-up.
pub(super) async fn set_desired(
    State(state): State<ApiState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    Json(req): Json<DesiredCapacityRequest>,
) -> ApiResult<Json<Fleet>> {
    state.authorize_operator(&headers)?;
    state
        .dispatcher
        .set_desired(&slug, req.desired, ScaleSource::Operator, &req.reason, Utc::now())
        .await?;
    Ok(Json(state.dispatcher.fleet(&slug).await?))
}

/// Latest published feed, or a live sample before the first publish.
pub(super) async fn metrics(State(state): State<ApiState>) -> Json<MetricsResponse> {
    let mut fleets = state.metrics.latest();
    if fleets.is_empty() {
        fleets = state.metrics.collect(Utc::now()).await;
    }
    Json(MetricsResponse {
        fleets,
        dispatcher: state.dispatcher.stats().await,
    })
}
