//! History Service
//!
//! Read side of runs, stage runs, logs, deployments and rollback records.

use keel_core::domain::deployment::{Deployment, RollbackPoint};
use keel_core::domain::log::LogEntry;
use keel_core::domain::rollback::RollbackRecord;
use keel_core::domain::run::{PipelineRun, PipelineStageRun};
use keel_core::dto::page::Page;
use keel_core::dto::run::RunFilter;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};

/// Rollback points listed when no limit is given
pub const DEFAULT_ROLLBACK_POINTS: usize = 10;

/// Get a run by ID
pub async fn get_run(engine: &Engine, id: Uuid) -> Result<PipelineRun> {
    engine
        .store
        .find_run(id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Run {}", id)))
}

/// Runs of a project, newest first
pub async fn list_runs(engine: &Engine, project_id: Uuid, filter: &RunFilter) -> Result<Page<PipelineRun>> {
    engine.project(project_id)?;

    if let (Some(from), Some(to)) = (filter.from, filter.to)
        && from > to
    {
        return Err(EngineError::Validation(
            "'from' must not be after 'to'".to_string(),
        ));
    }

    Ok(engine.store.list_runs(project_id, filter).await?)
}

/// Stage runs of a run in execution order
pub async fn list_stage_runs(engine: &Engine, run_id: Uuid) -> Result<Vec<PipelineStageRun>> {
    get_run(engine, run_id).await?;
    Ok(engine.store.list_stage_runs(run_id).await?)
}

/// Log lines of a stage run in emission order
pub async fn stage_logs(engine: &Engine, stage_run_id: Uuid) -> Result<Vec<LogEntry>> {
    Ok(engine.store.list_logs(stage_run_id).await?)
}

/// Deployments of a project, newest first
pub async fn list_deployments(
    engine: &Engine,
    project_id: Uuid,
    server_id: Option<&str>,
) -> Result<Vec<Deployment>> {
    engine.project(project_id)?;
    Ok(engine.store.list_deployments(project_id, server_id).await?)
}

/// Deployments a project can be rolled back to, newest first
///
/// Only deployments that went live successfully are listed, and never the
/// rows created by a rollback.
pub async fn rollback_points(
    engine: &Engine,
    project_id: Uuid,
    server_id: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<RollbackPoint>> {
    let deployments = list_deployments(engine, project_id, server_id).await?;

    Ok(deployments
        .iter()
        .filter(|d| d.is_successful() && !d.is_rollback())
        .take(limit.unwrap_or(DEFAULT_ROLLBACK_POINTS))
        .map(RollbackPoint::from)
        .collect())
}

/// Rollback records of a project, newest first
pub async fn list_rollbacks(engine: &Engine, project_id: Uuid) -> Result<Vec<RollbackRecord>> {
    engine.project(project_id)?;
    Ok(engine.store.list_rollback_records(project_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, project};
    use keel_core::domain::deployment::DeploymentStatus;
    use keel_runner::channel::ScriptedChannel;

    #[tokio::test]
    async fn test_rollback_points() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let oldest = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(3), &[])
            .await;
        h.add_deployment("web-1", "bbb222", DeploymentStatus::Failed, chrono::Duration::hours(2), &[])
            .await;
        let current = h
            .add_deployment("web-1", "ccc333", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;

        let points = rollback_points(&h.engine, h.project.id, None, None).await.unwrap();
        let ids: Vec<_> = points.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![current.id, oldest.id]);
        assert!(!points[0].can_rollback);
        assert!(points[1].can_rollback);

        let limited = rollback_points(&h.engine, h.project.id, None, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_list_runs_rejects_inverted_range() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let now = chrono::Utc::now();
        let filter = RunFilter {
            from: Some(now),
            to: Some(now - chrono::Duration::days(1)),
            ..Default::default()
        };

        let result = list_runs(&h.engine, h.project.id, &filter).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_get_run_not_found() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        assert!(matches!(
            get_run(&h.engine, Uuid::new_v4()).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
