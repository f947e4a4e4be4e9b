//! Pipeline Run API Handlers
//!
//! HTTP endpoints for starting, cancelling and inspecting runs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use keel_core::domain::log::LogEntry;
use keel_core::domain::run::{PipelineRun, PipelineStageRun};
use keel_core::dto::page::Page;
use keel_core::dto::run::{RunFilter, StartRun};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::history_service;

/// POST /runs
/// Start a run; it executes in the background
pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRun>,
) -> ApiResult<(StatusCode, Json<PipelineRun>)> {
    tracing::info!(
        "Starting run for project {} on {}@{}",
        req.project_id,
        req.branch,
        req.commit_sha
    );

    let started = state.coordinator.start(req).await?;

    Ok((StatusCode::ACCEPTED, Json(started.run)))
}

/// GET /projects/{id}/runs
/// List runs of a project, newest first
pub async fn list_runs(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(filter): Query<RunFilter>,
) -> ApiResult<Json<Page<PipelineRun>>> {
    tracing::debug!("Listing runs of project {}", project_id);

    let page = history_service::list_runs(&state.engine, project_id, &filter).await?;

    Ok(Json(page))
}

/// GET /runs/{id}
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::debug!("Getting run: {}", id);

    let run = history_service::get_run(&state.engine, id).await?;

    Ok(Json(run))
}

/// POST /runs/{id}/cancel
/// Request cancellation; takes effect at the next stage boundary
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancelling run: {}", id);

    state.coordinator.cancel(id).await?;

    Ok(StatusCode::ACCEPTED)
}

/// GET /runs/{id}/stages
pub async fn list_stage_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<PipelineStageRun>>> {
    tracing::debug!("Listing stage runs of run {}", id);

    let stages = history_service::list_stage_runs(&state.engine, id).await?;

    Ok(Json(stages))
}

/// GET /stage-runs/{id}/logs
pub async fn get_stage_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    tracing::debug!("Getting logs of stage run {}", id);

    let logs = history_service::stage_logs(&state.engine, id).await?;

    Ok(Json(logs))
}
