use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::{ApiResult, ApiState};
use crate::scheduler::{Job, SubmitRequest, Submission};

/// `201` for a new job, `200` when the idempotency key matched a live one.
pub(super) async fn submit(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let submission = state.dispatcher.submit(req).await?;
    let status = match submission {
        Submission::Created(_) => StatusCode::CREATED,
        Submission::Existing(_) => StatusCode::OK,
    };
    Ok((status, Json(submission.into_job())))
}

pub(super) async fn get(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    Ok(Json(state.dispatcher.get_job(&id).await?))
}

pub(super) async fn cancel(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.dispatcher.cancel(&id).await?))
}
