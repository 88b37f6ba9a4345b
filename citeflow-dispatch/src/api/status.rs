//! Status and results endpoints

use super::{ApiResult, AppState};
use crate::dispatcher::{PollReport, ResultsReport};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct PollParams {
    /// Number of polls the client has made so far
    #[serde(default)]
    pub attempt: u32,
}

/// GET /requests/{request_id}/status
///
/// Triggers or continues dispatch, then reports progress and a suggested
/// re-poll delay.
pub async fn get_status(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Query(params): Query<PollParams>,
) -> ApiResult<Json<PollReport>> {
    let report = state.dispatcher.poll(request_id, params.attempt).await?;
    Ok(Json(report))
}

/// GET /requests/{request_id}/results
///
/// Returns whatever is available now; never dispatches.
pub async fn get_results(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Json<ResultsReport>> {
    let report = state.dispatcher.current_results(request_id).await?;
    Ok(Json(report))
}
