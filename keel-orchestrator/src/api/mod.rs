//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod deployment;
pub mod error;
pub mod health;
pub mod rollback;
pub mod run;
pub mod stage;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::PipelineRunCoordinator;
use crate::engine::Engine;
use crate::rollback::{RollbackExecutor, RollbackPlanner};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub coordinator: PipelineRunCoordinator,
    pub planner: RollbackPlanner,
    pub rollbacks: RollbackExecutor,
}

impl AppState {
    /// Wires the coordinator, planner and executor around one engine
    pub fn new(engine: Engine) -> Self {
        let rollbacks = RollbackExecutor::new(engine.clone());
        Self {
            coordinator: PipelineRunCoordinator::new(engine.clone(), rollbacks.clone()),
            planner: RollbackPlanner::new(engine.clone()),
            rollbacks,
            engine,
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Stage definitions
        .route(
            "/projects/{id}/stages",
            get(stage::list_stages).post(stage::create_stage),
        )
        .route(
            "/stages/{id}",
            get(stage::get_stage)
                .put(stage::update_stage)
                .delete(stage::delete_stage),
        )
        // Runs
        .route("/runs", post(run::start_run))
        .route("/projects/{id}/runs", get(run::list_runs))
        .route("/runs/{id}", get(run::get_run))
        .route("/runs/{id}/cancel", post(run::cancel_run))
        .route("/runs/{id}/stages", get(run::list_stage_runs))
        .route("/stage-runs/{id}/logs", get(run::get_stage_logs))
        // Deployments
        .route("/projects/{id}/deployments", get(deployment::list_deployments))
        .route(
            "/projects/{id}/rollback-points",
            get(deployment::list_rollback_points),
        )
        // Rollbacks
        .route("/rollbacks", post(rollback::execute_rollback))
        .route("/rollbacks/preview", post(rollback::preview_rollback))
        .route("/rollbacks/{plan_id}/cancel", post(rollback::cancel_rollback))
        .route("/projects/{id}/rollbacks", get(rollback::list_rollbacks))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{AppState, create_router};
    use crate::testing::Harness;

    pub fn router(h: &Harness) -> Router {
        create_router(AppState::new(h.engine.clone()))
    }

    /// Sends a request and returns the status with the JSON body (Null if empty)
    pub async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}
