//! Stage Definition API Handlers
//!
//! HTTP endpoints for managing the stages of a project's pipeline.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use keel_core::domain::stage::StageDefinition;
use keel_core::dto::stage::{CreateStage, UpdateStage};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::stage_service;

/// POST /projects/{id}/stages
/// Create a stage definition
pub async fn create_stage(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(req): Json<CreateStage>,
) -> ApiResult<(StatusCode, Json<StageDefinition>)> {
    tracing::info!("Creating stage '{}' for project {}", req.name, project_id);

    let stage = stage_service::create_stage(&state.engine, project_id, req).await?;

    Ok((StatusCode::CREATED, Json(stage)))
}

/// GET /projects/{id}/stages
/// List a project's stages in execution order
pub async fn list_stages(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<StageDefinition>>> {
    tracing::debug!("Listing stages of project {}", project_id);

    let stages = stage_service::list_stages(&state.engine, project_id).await?;

    Ok(Json(stages))
}

/// GET /stages/{id}
pub async fn get_stage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StageDefinition>> {
    tracing::debug!("Getting stage: {}", id);

    let stage = stage_service::get_stage(&state.engine, id).await?;

    Ok(Json(stage))
}

/// PUT /stages/{id}
/// Partially update a stage; runs already started keep their snapshot
pub async fn update_stage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStage>,
) -> ApiResult<Json<StageDefinition>> {
    tracing::info!("Updating stage: {}", id);

    let stage = stage_service::update_stage(&state.engine, id, req).await?;

    Ok(Json(stage))
}

/// DELETE /stages/{id}
pub async fn delete_stage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting stage: {}", id);

    stage_service::delete_stage(&state.engine, id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{router, send};
    use crate::testing::{harness, project};
    use axum::http::StatusCode;
    use keel_runner::channel::ScriptedChannel;
    use serde_json::json;

    #[tokio::test]
    async fn test_stage_crud() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let app = router(&h);
        let base = format!("/projects/{}/stages", h.project.id);

        let (status, created) = send(
            &app,
            "POST",
            &base,
            Some(json!({
                "name": "install",
                "stage_type": "pre_deploy",
                "order": 1,
                "commands": ["composer install"],
                "timeout_seconds": 300
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["enabled"], true);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, updated) = send(
            &app,
            "PUT",
            &format!("/stages/{}", id),
            Some(json!({ "timeout_seconds": 600 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["timeout_seconds"], 600);
        assert_eq!(updated["name"], "install");

        let (status, listed) = send(&app, "GET", &base, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "DELETE", &format!("/stages/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, "GET", &format!("/stages/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_invalid_stage_is_rejected() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let (status, body) = send(
            &router(&h),
            "POST",
            &format!("/projects/{}/stages", h.project.id),
            Some(json!({
                "name": "install",
                "stage_type": "deploy",
                "order": 1,
                "commands": [],
                "timeout_seconds": 300
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Validation error"));
    }
}
