//! Rollback planner
//!
//! Builds the ordered step list that takes a server from one deployment back
//! to an older one:
//!
//! 1. stop services
//! 2. revert migrations applied after the target, newest first (database)
//! 3. rsync the target release over the live tree (files)
//! 4. restore the target's environment and revision marker
//! 5. restart services
//! 6. health check
//!
//! Planning never writes anything.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::domain::deployment::Deployment;
use keel_core::domain::project::ProjectSettings;
use keel_core::domain::rollback::{
    RollbackOptions, RollbackPlan, RollbackPreview, RollbackStep, RollbackStepKind,
};
use keel_core::dto::rollback::RollbackRequest;
use keel_runner::channel::shell_quote;
use keel_runner::vars::layered_env;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};

/// Placeholder replaced by the migration name in `migration_down_command`
pub const MIGRATION_PLACEHOLDER: &str = "{migration}";

/// Plans rollbacks from stored deployments
#[derive(Clone)]
pub struct RollbackPlanner {
    engine: Engine,
}

impl RollbackPlanner {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Resolves the request's deployments and builds a plan
    ///
    /// Without an explicit source, the current deployment of the target's
    /// server is rolled back.
    pub async fn plan(&self, request: &RollbackRequest) -> Result<RollbackPlan> {
        let project = self.engine.project(request.project_id)?;

        let target = self
            .engine
            .store
            .find_deployment(request.target_deployment_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("Deployment {}", request.target_deployment_id))
            })?;

        let source = match request.source_deployment_id {
            Some(id) => self
                .engine
                .store
                .find_deployment(id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("Deployment {}", id)))?,
            None => self
                .engine
                .store
                .current_deployment(project.id, &target.server_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "Server {} has no current deployment to roll back",
                        target.server_id
                    ))
                })?,
        };

        let plan = build_plan(&project, &source, &target, request.options.clone())?;

        tracing::info!(
            "Rollback plan {} for project {}: {} -> {} on {:?} ({} steps)",
            plan.id,
            project.id,
            plan.source_commit,
            plan.target_commit,
            plan.server_ids,
            plan.steps.len()
        );

        Ok(plan)
    }

    /// Plans without executing; nothing is written
    pub async fn preview(&self, request: &RollbackRequest) -> Result<RollbackPreview> {
        let plan = self.plan(request).await?;
        Ok(preview_of(&plan))
    }
}

/// Builds the plan rolling `source` back to `target`
///
/// # Arguments
/// * `project` - Settings of the project both deployments belong to
/// * `source` - Deployment being undone
/// * `target` - Older successful deployment to restore
/// * `options` - Components and servers to roll back
pub fn build_plan(
    project: &ProjectSettings,
    source: &Deployment,
    target: &Deployment,
    options: RollbackOptions,
) -> Result<RollbackPlan> {
    validate(project, source, target)?;

    let server_ids = resolve_servers(project, source, &options)?;

    let migrations_reverted: Vec<String> = if options.include_database {
        let kept: BTreeSet<&str> = target.migrations.iter().map(String::as_str).collect();
        source
            .migrations
            .iter()
            .rev()
            .filter(|m| !kept.contains(m.as_str()))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    let affected_files = if options.include_files {
        affected_files(project, &source.files, &target.files)
    } else {
        Vec::new()
    };

    let mut steps = Vec::new();

    if let Some(stop) = &project.stop_command {
        steps.push(RollbackStep {
            kind: RollbackStepKind::StopServices,
            description: "Stop services".to_string(),
            command: stop.clone(),
            timeout_seconds: 120,
            estimated_seconds: 10,
        });
    }

    if !migrations_reverted.is_empty() {
        let Some(down) = &project.migration_down_command else {
            return Err(EngineError::Validation(format!(
                "Project '{}' has no migration rollback command; {} migration(s) cannot be reverted",
                project.slug,
                migrations_reverted.len()
            )));
        };
        for migration in &migrations_reverted {
            steps.push(RollbackStep {
                kind: RollbackStepKind::ReverseMigration,
                description: format!("Revert migration {}", migration),
                command: down.replace(MIGRATION_PLACEHOLDER, &shell_quote(migration)),
                timeout_seconds: 300,
                estimated_seconds: 15,
            });
        }
    }

    if options.include_files {
        // has_artifact() was checked by validate()
        let artifact = target.artifact_path.clone().unwrap_or_default();
        steps.push(RollbackStep {
            kind: RollbackStepKind::RestoreFiles,
            description: format!("Restore files of {}", target.commit_sha),
            command: restore_files_command(project, &artifact),
            timeout_seconds: 600,
            estimated_seconds: 10 + affected_files.len() as u64 / 50,
        });
    }

    steps.push(RollbackStep {
        kind: RollbackStepKind::RestoreEnvironment,
        description: format!("Restore environment of {}", target.commit_sha),
        command: restore_environment_command(project, target),
        timeout_seconds: 30,
        estimated_seconds: 1,
    });

    if let Some(start) = &project.start_command {
        steps.push(RollbackStep {
            kind: RollbackStepKind::RestartServices,
            description: "Restart services".to_string(),
            command: start.clone(),
            timeout_seconds: 120,
            estimated_seconds: 15,
        });
    }

    if let Some(check) = &project.health_check_command {
        steps.push(RollbackStep {
            kind: RollbackStepKind::HealthCheck,
            description: "Health check".to_string(),
            command: check.clone(),
            timeout_seconds: 60,
            estimated_seconds: 5,
        });
    }

    Ok(RollbackPlan {
        id: Uuid::new_v4(),
        project_id: project.id,
        source_deployment_id: source.id,
        target_deployment_id: target.id,
        source_commit: source.commit_sha.clone(),
        target_commit: target.commit_sha.clone(),
        options,
        server_ids,
        steps,
        env_vars: layered_env([&project.environment, &target.environment_snapshot]),
        affected_files,
        migrations_reverted,
        created_at: chrono::Utc::now(),
    })
}

/// Dry-run view of a plan
pub fn preview_of(plan: &RollbackPlan) -> RollbackPreview {
    RollbackPreview {
        plan_id: plan.id,
        source_deployment_id: plan.source_deployment_id,
        target_deployment_id: plan.target_deployment_id,
        server_ids: plan.server_ids.clone(),
        steps: plan.steps.clone(),
        affected_files: plan.affected_files.clone(),
        migrations_reverted: plan.migrations_reverted.clone(),
        estimated_downtime_seconds: plan.steps.iter().map(|s| s.estimated_seconds).sum(),
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate(project: &ProjectSettings, source: &Deployment, target: &Deployment) -> Result<()> {
    if source.project_id != project.id || target.project_id != project.id {
        return Err(EngineError::Validation(
            "Source and target deployments must belong to the project".to_string(),
        ));
    }

    if source.id == target.id {
        return Err(EngineError::Validation(
            "Cannot roll back a deployment to itself".to_string(),
        ));
    }

    if !target.is_successful() {
        return Err(EngineError::Validation(format!(
            "Deployment {} is {} and cannot be a rollback target",
            target.id, target.status
        )));
    }

    if !target.has_artifact() {
        return Err(EngineError::Validation(format!(
            "Commit artifact of deployment {} is missing",
            target.id
        )));
    }

    if target.created_at >= source.created_at {
        return Err(EngineError::Validation(format!(
            "Deployment {} is not older than deployment {}",
            target.id, source.id
        )));
    }

    Ok(())
}

fn resolve_servers(
    project: &ProjectSettings,
    source: &Deployment,
    options: &RollbackOptions,
) -> Result<Vec<String>> {
    if options.server_ids.is_empty() {
        return Ok(vec![source.server_id.clone()]);
    }

    let mut servers = Vec::with_capacity(options.server_ids.len());
    for server in &options.server_ids {
        if !project.servers.contains(server) {
            return Err(EngineError::Validation(format!(
                "Server '{}' does not belong to project '{}'",
                server, project.slug
            )));
        }
        if !servers.contains(server) {
            servers.push(server.clone());
        }
    }
    Ok(servers)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Release-relative paths whose content differs between the two manifests
fn affected_files(
    project: &ProjectSettings,
    source: &BTreeMap<String, String>,
    target: &BTreeMap<String, String>,
) -> Vec<String> {
    source
        .keys()
        .chain(target.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|path| source.get(*path) != target.get(*path))
        .filter(|path| !project.is_excluded(path))
        .cloned()
        .collect()
}

fn restore_files_command(project: &ProjectSettings, artifact: &str) -> String {
    let mut command = String::from("rsync -a --delete");
    for exclude in &project.rollback_excludes {
        let exclude = exclude.trim_start_matches("./").trim_matches('/');
        if !exclude.is_empty() {
            command.push_str(&format!(" --exclude {}", shell_quote(&format!("/{}", exclude))));
        }
    }
    command.push_str(&format!(
        " {} {}",
        shell_quote(&format!("{}/", artifact.trim_end_matches('/'))),
        shell_quote(&format!("{}/", project.current_path()))
    ));
    command
}

fn restore_environment_command(project: &ProjectSettings, target: &Deployment) -> String {
    let mut parts = Vec::new();

    if !target.environment_snapshot.is_empty() && !project.is_excluded(".env") {
        let lines: Vec<String> = target
            .environment_snapshot
            .iter()
            .map(|(k, v)| shell_quote(&format!("{}={}", k, v)))
            .collect();
        parts.push(format!(
            "printf '%s\\n' {} > {}",
            lines.join(" "),
            shell_quote(&format!("{}/.env", project.current_path()))
        ));
    }

    parts.push(format!(
        "printf '%s\\n' {} > {}",
        shell_quote(&target.commit_sha),
        shell_quote(&format!("{}/REVISION", project.deploy_path.trim_end_matches('/')))
    ));

    parts.join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, project};
    use crate::repository::RunHistoryStore;
    use keel_core::domain::deployment::DeploymentStatus;
    use keel_runner::channel::ScriptedChannel;

    fn kinds(plan: &RollbackPlan) -> Vec<RollbackStepKind> {
        plan.steps.iter().map(|s| s.kind).collect()
    }

    fn options(include_database: bool, include_files: bool) -> RollbackOptions {
        RollbackOptions {
            include_database,
            include_files,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_plan_step_order() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &["m1"])
            .await;
        let source = h
            .add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &["m1", "m2", "m3"])
            .await;

        let plan = build_plan(&h.project, &source, &target, options(true, true)).unwrap();

        assert_eq!(
            kinds(&plan),
            vec![
                RollbackStepKind::StopServices,
                RollbackStepKind::ReverseMigration,
                RollbackStepKind::ReverseMigration,
                RollbackStepKind::RestoreFiles,
                RollbackStepKind::RestoreEnvironment,
                RollbackStepKind::RestartServices,
                RollbackStepKind::HealthCheck,
            ]
        );
        assert_eq!(plan.migrations_reverted, vec!["m3".to_string(), "m2".to_string()]);
        assert_eq!(plan.steps[1].command, "php artisan migrate:down 'm3'");
        assert_eq!(plan.server_ids, vec!["web-1".to_string()]);

        let rsync = &plan.steps[3].command;
        assert!(rsync.starts_with("rsync -a --delete --exclude '/storage'"));
        assert!(rsync.ends_with("'/var/www/shop/releases/aaa111/' '/var/www/shop/current/'"));
        assert!(plan.steps[4].command.contains("'aaa111' > '/var/www/shop/REVISION'"));
    }

    #[tokio::test]
    async fn test_components_are_optional() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        let source = h
            .add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &["m1"])
            .await;

        let plan = build_plan(&h.project, &source, &target, options(false, false)).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![
                RollbackStepKind::StopServices,
                RollbackStepKind::RestoreEnvironment,
                RollbackStepKind::RestartServices,
                RollbackStepKind::HealthCheck,
            ]
        );
        assert!(plan.migrations_reverted.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_newer_target() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let source = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        let target = h
            .add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;

        let result = build_plan(&h.project, &source, &target, options(false, true));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_rejects_missing_artifact() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let mut target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        target.artifact_path = None;
        let source = h
            .add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;

        let err = build_plan(&h.project, &source, &target, options(false, true)).unwrap_err();
        assert!(err.to_string().contains("artifact"));
    }

    #[tokio::test]
    async fn test_rejects_unsuccessful_target() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Failed, chrono::Duration::hours(2), &[])
            .await;
        let source = h
            .add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;

        let result = build_plan(&h.project, &source, &target, options(false, true));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_rejects_foreign_server() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        let source = h
            .add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;

        let mut opts = options(false, true);
        opts.server_ids = vec!["db-9".to_string()];
        let result = build_plan(&h.project, &source, &target, opts);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_database_rollback_needs_down_command() {
        let mut settings = project(&["web-1"]);
        settings.migration_down_command = None;
        let h = harness(settings, ScriptedChannel::new());
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        let source = h
            .add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &["m1"])
            .await;

        let result = build_plan(&h.project, &source, &target, options(true, false));
        assert!(matches!(result, Err(EngineError::Validation(_))));

        // Nothing to revert: fine without the command
        let mut same = source.clone();
        same.migrations.clear();
        assert!(build_plan(&h.project, &same, &target, options(true, false)).is_ok());
    }

    #[test]
    fn test_affected_files_honor_excludes() {
        let settings = project(&["web-1"]);
        let source: BTreeMap<String, String> = [
            ("app/Kernel.php", "b1"),
            ("app/New.php", "n1"),
            ("storage/logs/app.log", "l2"),
            ("public/index.php", "i1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let target: BTreeMap<String, String> = [
            ("app/Kernel.php", "a1"),
            ("app/Old.php", "o1"),
            ("storage/logs/app.log", "l1"),
            ("public/index.php", "i1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert_eq!(
            affected_files(&settings, &source, &target),
            vec!["app/Kernel.php", "app/New.php", "app/Old.php"]
        );
    }

    #[tokio::test]
    async fn test_preview_writes_nothing() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let target = h
            .add_deployment("web-1", "aaa111", DeploymentStatus::Superseded, chrono::Duration::hours(2), &[])
            .await;
        h.add_deployment("web-1", "bbb222", DeploymentStatus::Current, chrono::Duration::hours(1), &[])
            .await;

        let planner = RollbackPlanner::new(h.engine.clone());
        let preview = planner
            .preview(&RollbackRequest {
                project_id: h.project.id,
                target_deployment_id: target.id,
                source_deployment_id: None,
                options: RollbackOptions {
                    include_files: true,
                    dry_run: true,
                    ..Default::default()
                },
                triggered_by: "alice".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(preview.target_deployment_id, target.id);
        assert_eq!(preview.estimated_downtime_seconds, 10 + 10 + 1 + 15 + 5);

        let deployments = h.store.list_deployments(h.project.id, None).await.unwrap();
        assert_eq!(deployments.len(), 2);
        assert_eq!(
            h.store.current_deployment(h.project.id, "web-1").await.unwrap().unwrap().commit_sha,
            "bbb222"
        );
        assert!(h.store.list_rollback_records(h.project.id).await.unwrap().is_empty());
        assert!(h.channel.executed().is_empty());
    }
}
