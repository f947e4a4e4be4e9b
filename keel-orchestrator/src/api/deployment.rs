//! Deployment API Handlers
//!
//! Read-only views of the deployment log and of rollback destinations.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use keel_core::domain::deployment::{Deployment, RollbackPoint};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::history_service;

#[derive(Debug, Default, Deserialize)]
pub struct DeploymentQuery {
    pub server_id: Option<String>,
    pub limit: Option<usize>,
}

/// GET /projects/{id}/deployments
/// List deployments, newest first, optionally for one server
pub async fn list_deployments(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<DeploymentQuery>,
) -> ApiResult<Json<Vec<Deployment>>> {
    tracing::debug!("Listing deployments of project {}", project_id);

    let deployments =
        history_service::list_deployments(&state.engine, project_id, query.server_id.as_deref())
            .await?;

    Ok(Json(deployments))
}

/// GET /projects/{id}/rollback-points
/// Deployments a project can be rolled back to
pub async fn list_rollback_points(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<DeploymentQuery>,
) -> ApiResult<Json<Vec<RollbackPoint>>> {
    tracing::debug!("Listing rollback points of project {}", project_id);

    let points = history_service::rollback_points(
        &state.engine,
        project_id,
        query.server_id.as_deref(),
        query.limit,
    )
    .await?;

    Ok(Json(points))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{router, send};
    use crate::testing::{harness, project};
    use axum::http::StatusCode;
    use keel_core::domain::deployment::DeploymentStatus;
    use keel_runner::channel::ScriptedChannel;

    #[tokio::test]
    async fn test_deployments_and_rollback_points() {
        let h = harness(project(&["web-1", "web-2"]), ScriptedChannel::new());
        h.add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        h.add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;
        h.add_deployment("web-2", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;
        let app = router(&h);

        let (status, all) = send(
            &app,
            "GET",
            &format!("/projects/{}/deployments", h.project.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all.as_array().unwrap().len(), 3);

        let (_, points) = send(
            &app,
            "GET",
            &format!("/projects/{}/rollback-points?server_id=web-1", h.project.id),
            None,
        )
        .await;
        let points = points.as_array().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["commit_sha"], "bbb222");
        assert_eq!(points[0]["can_rollback"], false);
        assert_eq!(points[1]["commit_sha"], "aaa111");
        assert_eq!(points[1]["can_rollback"], true);

        let (_, limited) = send(
            &app,
            "GET",
            &format!("/projects/{}/rollback-points?limit=1", h.project.id),
            None,
        )
        .await;
        assert_eq!(limited.as_array().unwrap().len(), 1);
    }
}
