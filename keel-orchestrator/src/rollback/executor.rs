//! Rollback executor
//!
//! Runs a plan on each of its servers, one server after another. Within a
//! server the steps run in order and the first failing step stops that
//! server; other servers still run. Cancellation is checked before every
//! server and between steps. Nothing is retried.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use keel_core::domain::project::ProjectSettings;
use keel_core::domain::rollback::{
    RollbackPlan, RollbackRecord, RollbackStatus, ServerRollbackOutcome, ServerRollbackStatus,
};
use keel_runner::executor::{MAX_STAGE_BUDGET, connect_with_deadline, run_command};
use keel_runner::sink::NullSink;
use keel_runner::vars::{CommandVars, layered_env};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::notify::Event;

/// Actor recorded on rows created by a rollback
pub const ROLLBACK_ACTOR: &str = "rollback";

/// Executes rollback plans
#[derive(Clone)]
pub struct RollbackExecutor {
    engine: Engine,
    /// Source deployments with a rollback in progress
    active: Arc<Mutex<HashSet<Uuid>>>,
    /// Cancel flags of running plans
    cancels: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
}

/// Releases a source deployment and plan when execution ends
struct ActiveGuard<'a> {
    executor: &'a RollbackExecutor,
    source_id: Uuid,
    plan_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.executor.active.lock().unwrap().remove(&self.source_id);
        self.executor.cancels.lock().unwrap().remove(&self.plan_id);
    }
}

impl RollbackExecutor {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            active: Arc::new(Mutex::new(HashSet::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Requests cancellation of a running plan
    ///
    /// Takes effect before the next server or step.
    pub fn cancel(&self, plan_id: Uuid) -> Result<()> {
        match self.cancels.lock().unwrap().get(&plan_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!("Cancellation requested for rollback {}", plan_id);
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("Running rollback {}", plan_id))),
        }
    }

    /// Whether a rollback of `source_deployment_id` is in progress
    pub fn is_active(&self, source_deployment_id: Uuid) -> bool {
        self.active.lock().unwrap().contains(&source_deployment_id)
    }

    /// Executes a plan and records its outcome
    ///
    /// # Arguments
    /// * `plan` - Plan from the planner; dry-run plans are refused
    /// * `triggered_by` - Actor recorded on the rollback record
    /// * `run_id` - Failed run, for automatic rollbacks
    ///
    /// # Returns
    /// The record, or `RollbackPartialFailure` carrying it when any server failed
    pub async fn execute(
        &self,
        plan: &RollbackPlan,
        triggered_by: &str,
        run_id: Option<Uuid>,
    ) -> Result<RollbackRecord> {
        if plan.options.dry_run {
            return Err(EngineError::Validation(
                "Dry-run plans are previewed, not executed".to_string(),
            ));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.active.lock().unwrap();
            if !active.insert(plan.source_deployment_id) {
                return Err(EngineError::Concurrency(format!(
                    "Deployment {} is already being rolled back",
                    plan.source_deployment_id
                )));
            }
            self.cancels.lock().unwrap().insert(plan.id, cancel.clone());
        }
        let _guard = ActiveGuard {
            executor: self,
            source_id: plan.source_deployment_id,
            plan_id: plan.id,
        };

        let project = self.engine.project(plan.project_id)?;
        let source = self.deployment(plan.source_deployment_id).await?;
        let target = self.deployment(plan.target_deployment_id).await?;

        let started_at = chrono::Utc::now();
        info!(
            "Rollback {} started: {} -> {} on {:?}",
            plan.id, source.commit_sha, target.commit_sha, plan.server_ids
        );
        self.engine.notifier.publish(Event::RollbackStarted {
            plan_id: plan.id,
            project_id: plan.project_id,
            source_deployment_id: source.id,
            target_deployment_id: target.id,
            server_ids: plan.server_ids.clone(),
        });

        let mut outcomes = Vec::with_capacity(plan.server_ids.len());
        for server_id in &plan.server_ids {
            let outcome = if cancel.load(Ordering::SeqCst) {
                cancelled_outcome(server_id, 0, String::new())
            } else {
                self.rollback_server(&project, plan, &source, &target, server_id, &cancel)
                    .await
            };
            outcomes.push(outcome);
        }

        let status = RollbackStatus::from_outcomes(&outcomes);
        let error_message = match status {
            RollbackStatus::RolledBack => None,
            RollbackStatus::Cancelled => Some("Rollback cancelled".to_string()),
            RollbackStatus::RollbackFailed => Some(
                outcomes
                    .iter()
                    .filter(|o| o.status == ServerRollbackStatus::Failed)
                    .map(|o| {
                        format!(
                            "{}: {}",
                            o.server_id,
                            o.error_message.as_deref().unwrap_or("failed")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
        };

        let record = RollbackRecord {
            id: Uuid::new_v4(),
            project_id: plan.project_id,
            plan_id: plan.id,
            run_id,
            source_deployment_id: source.id,
            target_deployment_id: target.id,
            include_database: plan.options.include_database,
            include_files: plan.options.include_files,
            server_ids: plan.server_ids.clone(),
            dry_run: false,
            status,
            server_outcomes: outcomes,
            error_message,
            triggered_by: triggered_by.to_string(),
            started_at,
            completed_at: chrono::Utc::now(),
        };

        self.engine.store.create_rollback_record(&record).await?;

        self.engine.notifier.publish(Event::RollbackCompleted {
            plan_id: plan.id,
            project_id: plan.project_id,
            record_id: record.id,
            status,
        });

        match status {
            RollbackStatus::RollbackFailed => {
                error!(
                    "Rollback {} failed: {}",
                    plan.id,
                    record.error_message.as_deref().unwrap_or_default()
                );
                Err(EngineError::RollbackPartialFailure {
                    record: Box::new(record),
                })
            }
            _ => {
                info!(
                    "Rollback {} finished {} in {}s",
                    plan.id,
                    status,
                    record.duration_seconds()
                );
                Ok(record)
            }
        }
    }

    async fn deployment(&self, id: Uuid) -> Result<Deployment> {
        self.engine
            .store
            .find_deployment(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Deployment {}", id)))
    }

    /// Runs every step on one server; never returns early with an error
    async fn rollback_server(
        &self,
        project: &ProjectSettings,
        plan: &RollbackPlan,
        source: &Deployment,
        target: &Deployment,
        server_id: &str,
        cancel: &AtomicBool,
    ) -> ServerRollbackOutcome {
        let _server = self.engine.locks.acquire(server_id).await;

        let vars = CommandVars {
            project_slug: project.slug.clone(),
            project_path: project.deploy_path.clone(),
            branch: target.branch.clone(),
            commit_sha: target.commit_sha.clone(),
            run_number: 0,
            server_id: server_id.to_string(),
        };
        let env = layered_env([&plan.env_vars, &vars.env()]);

        let connect_budget = plan
            .steps
            .first()
            .map(|s| Duration::from_secs(s.timeout_seconds))
            .unwrap_or(Duration::from_secs(30))
            .min(MAX_STAGE_BUDGET);
        let mut session = match connect_with_deadline(
            self.engine.channel.as_ref(),
            server_id,
            Instant::now() + connect_budget,
            connect_budget,
        )
        .await
        {
            Ok(session) => session,
            Err(failure) => {
                warn!("Rollback {} on {}: {}", plan.id, server_id, failure.message);
                return ServerRollbackOutcome {
                    server_id: server_id.to_string(),
                    status: ServerRollbackStatus::Failed,
                    failure: Some(failure.kind),
                    failed_step: plan.steps.first().map(|s| s.kind),
                    steps_completed: 0,
                    error_message: Some(failure.message),
                    output: String::new(),
                    deployment_id: None,
                };
            }
        };

        let mut output = String::new();
        let mut failed = None;
        let mut completed = 0;
        for step in &plan.steps {
            if completed > 0 && cancel.load(Ordering::SeqCst) {
                break;
            }

            let command = vars.render(&step.command);
            let budget = Duration::from_secs(step.timeout_seconds).min(MAX_STAGE_BUDGET);
            info!("Rollback {} [{}] {}", plan.id, server_id, step.description);
            output.push_str(&format!("$ {}\n", command));

            let attempt = run_command(
                session.as_mut(),
                &command,
                &env,
                Instant::now() + budget,
                budget,
                &NullSink,
            )
            .await;
            output.push_str(&attempt.result.stdout);
            output.push_str(&attempt.result.stderr);

            if let Some(failure) = attempt.failure {
                failed = Some((step.kind, failure));
                break;
            }
            completed += 1;
        }

        session.disconnect().await;

        if let Some((kind, failure)) = failed {
            warn!(
                "Rollback {} failed on {} at {}: {}",
                plan.id, server_id, kind, failure.message
            );
            return ServerRollbackOutcome {
                server_id: server_id.to_string(),
                status: ServerRollbackStatus::Failed,
                failure: Some(failure.kind),
                failed_step: Some(kind),
                steps_completed: completed,
                error_message: Some(format!("Step {} failed: {}", kind, failure.message)),
                output,
                deployment_id: None,
            };
        }

        if completed < plan.steps.len() {
            info!(
                "Rollback {} cancelled on {} after {} step(s)",
                plan.id, server_id, completed
            );
            return cancelled_outcome(server_id, completed, output);
        }

        match self.record_deployment(plan, source, target, server_id).await {
            Ok(deployment_id) => ServerRollbackOutcome {
                server_id: server_id.to_string(),
                status: ServerRollbackStatus::Success,
                failure: None,
                failed_step: None,
                steps_completed: completed,
                error_message: None,
                output,
                deployment_id: Some(deployment_id),
            },
            Err(e) => {
                error!("Rollback {} on {}: failed to record deployment: {}", plan.id, server_id, e);
                ServerRollbackOutcome {
                    server_id: server_id.to_string(),
                    status: ServerRollbackStatus::Failed,
                    failure: None,
                    failed_step: None,
                    steps_completed: completed,
                    error_message: Some(format!("Failed to record deployment: {}", e)),
                    output,
                    deployment_id: None,
                }
            }
        }
    }

    /// Makes the restored state the server's current deployment
    async fn record_deployment(
        &self,
        plan: &RollbackPlan,
        source: &Deployment,
        target: &Deployment,
        server_id: &str,
    ) -> Result<Uuid> {
        let undone = if source.server_id == server_id {
            Some(source.clone())
        } else {
            self.engine
                .store
                .current_deployment(plan.project_id, server_id)
                .await?
                .filter(|current| current.id != target.id)
        };
        let base = undone.as_ref().unwrap_or(source);

        let now = chrono::Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            project_id: plan.project_id,
            server_id: server_id.to_string(),
            run_id: None,
            commit_sha: target.commit_sha.clone(),
            branch: target.branch.clone(),
            status: DeploymentStatus::Current,
            triggered_by: ROLLBACK_ACTOR.to_string(),
            rollback_of: Some(target.id),
            artifact_path: target.artifact_path.clone(),
            migrations: if plan.options.include_database {
                target.migrations.clone()
            } else {
                base.migrations.clone()
            },
            files: if plan.options.include_files {
                target.files.clone()
            } else {
                base.files.clone()
            },
            environment_snapshot: target.environment_snapshot.clone(),
            created_at: now,
            updated_at: now,
        };

        self.engine
            .store
            .promote_deployment(&deployment, undone.map(|d| d.id))
            .await?;

        Ok(deployment.id)
    }
}

fn cancelled_outcome(server_id: &str, steps_completed: usize, output: String) -> ServerRollbackOutcome {
    ServerRollbackOutcome {
        server_id: server_id.to_string(),
        status: ServerRollbackStatus::Cancelled,
        failure: None,
        failed_step: None,
        steps_completed,
        error_message: Some("Cancelled".to_string()),
        output,
        deployment_id: None,
    }
}
