//! Rollback API Handlers
//!
//! HTTP endpoints for previewing, executing and cancelling rollbacks.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keel_core::domain::rollback::{RollbackPreview, RollbackRecord};
use keel_core::dto::rollback::RollbackRequest;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::history_service;

/// POST /rollbacks/preview
/// Describe a rollback without touching any server or record
pub async fn preview_rollback(
    State(state): State<AppState>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<Json<RollbackPreview>> {
    tracing::debug!(
        "Previewing rollback of project {} to {}",
        req.project_id,
        req.target_deployment_id
    );

    let preview = state.planner.preview(&req).await?;

    Ok(Json(preview))
}

/// POST /rollbacks
/// Execute a rollback and wait for its record; dry runs answer with a preview
pub async fn execute_rollback(
    State(state): State<AppState>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<Response> {
    if req.triggered_by.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Validation error: triggered_by cannot be empty".to_string(),
        ));
    }

    if req.options.dry_run {
        let preview = state.planner.preview(&req).await?;
        return Ok(Json(preview).into_response());
    }

    tracing::info!(
        "Rolling back project {} to {} (requested by {})",
        req.project_id,
        req.target_deployment_id,
        req.triggered_by
    );

    let plan = state.planner.plan(&req).await?;

    // Runs on its own task so a dropped request cannot stop it mid-step
    let rollbacks = state.rollbacks.clone();
    let triggered_by = req.triggered_by.trim().to_string();
    let record: RollbackRecord =
        tokio::spawn(async move { rollbacks.execute(&plan, &triggered_by, None).await })
            .await
            .map_err(|e| ApiError::InternalError(format!("Rollback task failed: {}", e)))??;

    Ok(Json(record).into_response())
}

/// POST /rollbacks/{plan_id}/cancel
/// Stop a running rollback before its next step
pub async fn cancel_rollback(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancelling rollback: {}", plan_id);

    state.rollbacks.cancel(plan_id)?;

    Ok(StatusCode::ACCEPTED)
}

/// GET /projects/{id}/rollbacks
/// Rollback history of a project, newest first
pub async fn list_rollbacks(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<RollbackRecord>>> {
    tracing::debug!("Listing rollbacks of project {}", project_id);

    let records = history_service::list_rollbacks(&state.engine, project_id).await?;

    Ok(Json(records))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{router, send};
    use crate::repository::RunHistoryStore;
    use crate::testing::{harness, project};
    use axum::http::StatusCode;
    use keel_core::domain::deployment::DeploymentStatus;
    use keel_core::domain::rollback::RollbackStatus;
    use keel_runner::channel::{Reply, ScriptedChannel};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_preview_and_dry_run_write_nothing() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        h.add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;
        let app = router(&h);

        let request = json!({
            "project_id": h.project.id,
            "target_deployment_id": target.id,
            "include_files": true,
            "triggered_by": "alice"
        });
        let (status, preview) = send(&app, "POST", "/rollbacks/preview", Some(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["server_ids"], json!(["web-1"]));
        assert!(!preview["steps"].as_array().unwrap().is_empty());

        let mut dry_run = request;
        dry_run["dry_run"] = json!(true);
        let (status, body) = send(&app, "POST", "/rollbacks", Some(dry_run)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["estimated_downtime_seconds"].as_u64().unwrap() > 0);

        let (_, records) = send(&app, "GET", &format!("/projects/{}/rollbacks", h.project.id), None).await;
        assert!(records.as_array().unwrap().is_empty());
        assert!(h.channel.executed().is_empty());
    }

    #[tokio::test]
    async fn test_execute_rollback() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        h.add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;
        let app = router(&h);

        let (status, record) = send(
            &app,
            "POST",
            "/rollbacks",
            Some(json!({
                "project_id": h.project.id,
                "target_deployment_id": target.id,
                "include_files": true,
                "triggered_by": "alice"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "rolled_back");
        assert_eq!(record["triggered_by"], "alice");

        let (_, records) = send(&app, "GET", &format!("/projects/{}/rollbacks", h.project.id), None).await;
        assert_eq!(records.as_array().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_finishes_after_client_disconnects() {
        let channel = ScriptedChannel::new().on("systemctl stop", Reply::Sleep(Duration::from_secs(5)));
        let h = harness(project(&["web-1"]), channel);
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        h.add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;
        let app = router(&h);

        let request = json!({
            "project_id": h.project.id,
            "target_deployment_id": target.id,
            "include_files": true,
            "triggered_by": "alice"
        });
        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            send(&app, "POST", "/rollbacks", Some(request)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(60)).await;

        let records = h.store.list_rollback_records(h.project.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RollbackStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_partial_failure_returns_record() {
        let channel = ScriptedChannel::new().on("curl -fsS", Reply::fail(22, "503"));
        let h = harness(project(&["web-1"]), channel);
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        h.add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;

        let (status, body) = send(
            &router(&h),
            "POST",
            "/rollbacks",
            Some(json!({
                "project_id": h.project.id,
                "target_deployment_id": target.id,
                "include_files": true,
                "triggered_by": "alice"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["record"]["status"], "rollback_failed");
        let outcome = &body["record"]["server_outcomes"][0];
        assert_eq!(outcome["failure"], "ExecutionError");
        assert_eq!(outcome["failed_step"], "health_check");
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let current = h
            .add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;
        let app = router(&h);

        let (status, _) = send(
            &app,
            "POST",
            "/rollbacks",
            Some(json!({
                "project_id": h.project.id,
                "target_deployment_id": current.id,
                "triggered_by": "alice"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/rollbacks/preview",
            Some(json!({
                "project_id": h.project.id,
                "target_deployment_id": uuid::Uuid::new_v4(),
                "triggered_by": "alice"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/rollbacks/{}/cancel", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
