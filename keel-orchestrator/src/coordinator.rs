//! Pipeline run coordinator
//!
//! Creates runs and drives them to a terminal status:
//! - one run per project at a time, enforced by the persisted run lock
//! - stages execute one after another in phase order, on every server
//! - a failing stage either aborts the run or is tolerated, per stage
//! - deployments are recorded when the deploy phase completes
//! - a blocking failure after the deploy phase began can trigger an
//!   automatic rollback
//!
//! Each run is driven by its own task. Cancellation is cooperative and
//! observed at stage boundaries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use keel_core::domain::project::ProjectSettings;
use keel_core::domain::rollback::{RollbackOptions, RollbackStatus};
use keel_core::domain::run::{PipelineRun, PipelineStageRun, RunStatus};
use keel_core::domain::stage::StageType;
use keel_core::dto::run::StartRun;
use keel_runner::executor::{StageFailure, StageSnapshot};
use keel_runner::sink::{InMemoryLogBuffer, NullSink};
use keel_runner::vars::{CommandVars, layered_env};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::notify::Event;
use crate::repository::Store;
use crate::rollback::RollbackExecutor;
use crate::rollback::planner::build_plan;

/// Actor recorded on rollbacks started by a failed run
pub const AUTO_ROLLBACK_ACTOR: &str = "auto-rollback";

/// Starts, drives and cancels pipeline runs
#[derive(Clone)]
pub struct PipelineRunCoordinator {
    engine: Engine,
    rollbacks: RollbackExecutor,
    /// Cancel flags of runs driven by this process
    active: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
}

/// A run that was accepted and is now executing in the background
pub struct StartedRun {
    /// The run as created (status `pending`)
    pub run: PipelineRun,
    handle: JoinHandle<()>,
}

impl StartedRun {
    /// Waits for the run to reach a terminal status
    pub async fn wait(self) {
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            std::panic::resume_unwind(e.into_panic());
        }
    }
}

impl PipelineRunCoordinator {
    /// # Arguments
    /// * `engine` - Shared engine state
    /// * `rollbacks` - Executor shared with manual rollbacks
    pub fn new(engine: Engine, rollbacks: RollbackExecutor) -> Self {
        Self {
            engine,
            rollbacks,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a run and starts executing it
    ///
    /// Fails without creating anything when the trigger is invalid, the
    /// project has no enabled stages, or another run of the project holds the
    /// run lock.
    pub async fn start(&self, req: StartRun) -> Result<StartedRun> {
        let project = self.engine.project(req.project_id)?;
        validate_trigger(&req)?;

        let run_id = Uuid::new_v4();
        if !self.engine.store.try_acquire_lock(project.id, run_id).await? {
            return Err(EngineError::Concurrency(format!(
                "Project '{}' already has a run in progress",
                project.slug
            )));
        }

        let (run, stages) = match self.prepare(&project, run_id, &req).await {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(release) = self.engine.store.release_lock(project.id, run_id).await {
                    warn!("Failed to release lock of project {}: {}", project.id, release);
                }
                return Err(e);
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        self.active.lock().unwrap().insert(run.id, cancel.clone());

        info!(
            "Run {} (#{}) created for project '{}' on {}@{} ({} stages)",
            run.id,
            run.run_number,
            project.slug,
            run.branch,
            run.commit_sha,
            stages.len()
        );

        let worker = RunWorker {
            engine: self.engine.clone(),
            rollbacks: self.rollbacks.clone(),
            active: self.active.clone(),
            project,
            run: run.clone(),
            stages,
            cancel,
        };
        let handle = tokio::spawn(worker.drive());

        Ok(StartedRun { run, handle })
    }

    /// Requests cancellation of a run
    ///
    /// The stage in flight finishes; every later stage is skipped.
    pub async fn cancel(&self, run_id: Uuid) -> Result<()> {
        let flag = self.active.lock().unwrap().get(&run_id).cloned();
        if let Some(flag) = flag {
            flag.store(true, Ordering::SeqCst);
            info!("Cancellation requested for run {}", run_id);
            return Ok(());
        }

        match self.engine.store.find_run(run_id).await? {
            None => Err(EngineError::NotFound(format!("Run {}", run_id))),
            Some(run) if run.status.is_terminal() => Err(EngineError::InvalidState(format!(
                "Run {} already finished ({})",
                run_id, run.status
            ))),
            Some(_) => Err(EngineError::InvalidState(format!(
                "Run {} is not executing in this process",
                run_id
            ))),
        }
    }

    /// Whether this process is driving the run
    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.active.lock().unwrap().contains_key(&run_id)
    }

    async fn prepare(
        &self,
        project: &ProjectSettings,
        run_id: Uuid,
        req: &StartRun,
    ) -> Result<(PipelineRun, Vec<PipelineStageRun>)> {
        let definitions: Vec<_> = self
            .engine
            .store
            .list_stages(project.id)
            .await?
            .into_iter()
            .filter(|stage| stage.enabled)
            .collect();

        if definitions.is_empty() {
            return Err(EngineError::Validation(format!(
                "Project '{}' has no enabled stages",
                project.slug
            )));
        }

        let run = PipelineRun {
            id: run_id,
            project_id: project.id,
            run_number: self.engine.store.next_run_number(project.id).await?,
            branch: req.branch.trim().to_string(),
            commit_sha: req.commit_sha.trim().to_string(),
            triggered_by: req.triggered_by.trim().to_string(),
            status: RunStatus::Pending,
            error_message: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let stages: Vec<_> = definitions
            .iter()
            .map(|definition| PipelineStageRun::snapshot(run_id, definition))
            .collect();

        self.engine.store.create_run(&run, &stages).await?;

        Ok((run, stages))
    }
}

const MAX_BRANCH_LEN: usize = 255;
const MAX_COMMIT_SHA_LEN: usize = 64;
const MAX_TRIGGERED_BY_LEN: usize = 255;

fn validate_trigger(req: &StartRun) -> Result<()> {
    if req.branch.trim().is_empty() {
        return Err(EngineError::Validation("branch cannot be empty".to_string()));
    }
    if req.commit_sha.trim().is_empty() {
        return Err(EngineError::Validation("commit_sha cannot be empty".to_string()));
    }
    if req.commit_sha.trim().contains(['/', ' ']) {
        return Err(EngineError::Validation(format!(
            "Invalid commit_sha '{}'",
            req.commit_sha
        )));
    }
    if req.triggered_by.trim().is_empty() {
        return Err(EngineError::Validation("triggered_by cannot be empty".to_string()));
    }
    for (field, value, max) in [
        ("branch", &req.branch, MAX_BRANCH_LEN),
        ("commit_sha", &req.commit_sha, MAX_COMMIT_SHA_LEN),
        ("triggered_by", &req.triggered_by, MAX_TRIGGERED_BY_LEN),
    ] {
        if value.trim().chars().count() > max {
            return Err(EngineError::Validation(format!(
                "{} is too long (max {} characters)",
                field, max
            )));
        }
    }
    Ok(())
}

/// State of one run while it executes
struct RunWorker {
    engine: Engine,
    rollbacks: RollbackExecutor,
    active: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
    project: ProjectSettings,
    run: PipelineRun,
    stages: Vec<PipelineStageRun>,
    cancel: Arc<AtomicBool>,
}

impl RunWorker {
    async fn drive(mut self) {
        self.run.status = RunStatus::Running;
        self.run.started_at = Some(chrono::Utc::now());
        self.save_run().await;

        self.engine.notifier.publish(Event::RunStarted {
            run_id: self.run.id,
            project_id: self.project.id,
            run_number: self.run.run_number,
            branch: self.run.branch.clone(),
            commit_sha: self.run.commit_sha.clone(),
        });

        let guard = WorkerGuard {
            heartbeat: self.spawn_heartbeat(),
            active: self.active.clone(),
            run_id: self.run.id,
        };

        let last_deploy = self
            .stages
            .iter()
            .rposition(|stage| stage.stage_type == StageType::Deploy);
        let mut blocking: Option<EngineError> = None;
        let mut tolerated: Option<String> = None;
        let mut cancelled = false;
        let mut deploy_started = false;
        let mut promoted = Vec::new();

        for index in 0..self.stages.len() {
            if blocking.is_none() && !cancelled && self.cancel.load(Ordering::SeqCst) {
                info!(
                    "Run {} cancelled before stage '{}'",
                    self.run.id, self.stages[index].name
                );
                cancelled = true;
            }

            if blocking.is_some() || cancelled {
                self.stages[index].mark_skipped();
                self.save_stage(index).await;
                continue;
            }

            if self.stages[index].stage_type == StageType::Deploy {
                deploy_started = true;
            }

            if let Some(failure) = self.execute_stage(index).await {
                let stage = &self.stages[index];
                let message = format!("Stage '{}' failed: {}", stage.name, failure.message);
                if stage.continue_on_failure {
                    warn!("Run {}: {} (continuing)", self.run.id, message);
                    tolerated.get_or_insert(message);
                } else {
                    warn!("Run {}: {}", self.run.id, message);
                    blocking = Some(EngineError::from_failure(failure.kind, message));
                }
            }

            if Some(index) == last_deploy && blocking.is_none() {
                match self.record_deployments().await {
                    Ok(rows) => promoted = rows,
                    Err(e) => {
                        error!("Run {}: failed to record deployments: {}", self.run.id, e);
                        blocking = Some(e);
                    }
                }
            }
        }

        let status = match (&blocking, cancelled) {
            (Some(_), _) if deploy_started => self.recover(promoted).await,
            (Some(_), _) => RunStatus::Failed,
            (None, true) => RunStatus::Cancelled,
            (None, false) if tolerated.is_some() => RunStatus::Failed,
            (None, false) => RunStatus::Success,
        };

        self.run.status = status;
        self.run.completed_at = Some(chrono::Utc::now());
        self.run.error_message = match status {
            RunStatus::Success => None,
            RunStatus::Cancelled => Some("Run cancelled".to_string()),
            _ => blocking.map(|e| e.to_string()).or(tolerated),
        };
        self.save_run().await;

        guard.heartbeat.abort();
        if let Err(e) = self
            .engine
            .store
            .release_lock(self.project.id, self.run.id)
            .await
        {
            warn!("Run {}: failed to release project lock: {}", self.run.id, e);
        }
        drop(guard);

        let event = match status {
            RunStatus::Success => Event::RunCompleted {
                run_id: self.run.id,
                project_id: self.project.id,
                run_number: self.run.run_number,
            },
            other => Event::RunFailed {
                run_id: self.run.id,
                project_id: self.project.id,
                run_number: self.run.run_number,
                status: other,
                error: self.run.error_message.clone(),
            },
        };
        self.engine.notifier.publish(event);

        info!(
            "Run {} (#{}) finished with status {}",
            self.run.id, self.run.run_number, status
        );
    }

    /// Runs one stage on every server, stopping at the first failing server
    async fn execute_stage(&mut self, index: usize) -> Option<StageFailure> {
        self.stages[index].mark_running();
        self.save_stage(index).await;

        let stage = self.stages[index].clone();
        let buffer = InMemoryLogBuffer::new();
        let flusher = LogFlusher::spawn(
            self.engine.store.clone(),
            stage.id,
            buffer.clone(),
            self.engine.settings.log_flush_interval,
        );

        let mut commands = Vec::new();
        let mut failure = None;
        let mut last_server = None;
        let mut exit_code = None;
        for server_id in &self.project.servers {
            let vars = self.vars(server_id);
            let snapshot = StageSnapshot {
                name: stage.name.clone(),
                commands: stage.commands.iter().map(|c| vars.render(c)).collect(),
                timeout: Duration::from_secs(stage.timeout_seconds),
                env: layered_env([&self.project.environment, &vars.env(), &stage.env_vars]),
            };

            let result = self
                .engine
                .executor
                .execute_stage(&snapshot, server_id, self.engine.channel.as_ref(), &buffer)
                .await;

            last_server = Some(server_id.clone());
            exit_code = result.commands.last().and_then(|c| c.exit_code);
            commands.extend(result.commands);
            if let Some(f) = result.failure {
                failure = Some(f);
                break;
            }
        }

        flusher.finish().await;

        let stage = &mut self.stages[index];
        stage.server_id = last_server;
        stage.exit_code = exit_code;
        for command in &commands {
            stage.output.push_str(&command.stdout);
            stage.output.push_str(&command.stderr);
        }
        stage.command_results = commands;
        match &failure {
            Some(f) => stage.mark_failed(f.kind, &f.message),
            None => stage.mark_success(),
        }
        self.save_stage(index).await;

        failure
    }

    /// Promotes a new current deployment on every server
    async fn record_deployments(&self) -> Result<Vec<Deployment>> {
        let mut rows = Vec::with_capacity(self.project.servers.len());
        for server_id in &self.project.servers {
            let deployment = self
                .snapshot_deployment(server_id, DeploymentStatus::Current)
                .await;
            self.engine.store.promote_deployment(&deployment, None).await?;
            info!(
                "Deployment {} of {} is now current on {}",
                deployment.id, deployment.commit_sha, server_id
            );
            rows.push(deployment);
        }
        Ok(rows)
    }

    /// Handles a blocking failure once the deploy phase has begun
    async fn recover(&self, promoted: Vec<Deployment>) -> RunStatus {
        let sources = if promoted.is_empty() {
            self.record_failed_deployments().await
        } else {
            promoted
        };

        if !self.project.auto_rollback {
            return RunStatus::Failed;
        }

        info!("Run {}: starting automatic rollback", self.run.id);
        self.auto_rollback(&sources).await
    }

    async fn record_failed_deployments(&self) -> Vec<Deployment> {
        let mut rows = Vec::with_capacity(self.project.servers.len());
        for server_id in &self.project.servers {
            let deployment = self
                .snapshot_deployment(server_id, DeploymentStatus::Failed)
                .await;
            match self.engine.store.create_deployment(&deployment).await {
                Ok(()) => rows.push(deployment),
                Err(e) => error!(
                    "Run {}: failed to record failed deployment on {}: {}",
                    self.run.id, server_id, e
                ),
            }
        }
        rows
    }

    /// Rolls every server back to the deployment before `sources`
    async fn auto_rollback(&self, sources: &[Deployment]) -> RunStatus {
        let mut attempted = 0;
        let mut all_rolled_back = true;

        for source in sources {
            let target = match self.previous_deployment(source).await {
                Ok(Some(target)) => target,
                Ok(None) => {
                    info!(
                        "Run {}: no earlier deployment on {}, leaving it as is",
                        self.run.id, source.server_id
                    );
                    continue;
                }
                Err(e) => {
                    error!("Run {}: {}", self.run.id, e);
                    all_rolled_back = false;
                    continue;
                }
            };
            attempted += 1;

            let options = RollbackOptions {
                include_database: self.project.migration_down_command.is_some(),
                include_files: true,
                server_ids: vec![source.server_id.clone()],
                dry_run: false,
            };
            let outcome = match build_plan(&self.project, source, &target, options) {
                Ok(plan) => self
                    .rollbacks
                    .execute(&plan, AUTO_ROLLBACK_ACTOR, Some(self.run.id))
                    .await
                    .map(|record| record.status),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(RollbackStatus::RolledBack) => {
                    info!(
                        "Run {}: {} rolled back to {}",
                        self.run.id, source.server_id, target.commit_sha
                    );
                }
                Ok(status) => {
                    warn!(
                        "Run {}: rollback of {} ended {}",
                        self.run.id, source.server_id, status
                    );
                    all_rolled_back = false;
                }
                Err(e) => {
                    error!(
                        "Run {}: rollback of {} failed: {}",
                        self.run.id, source.server_id, e
                    );
                    all_rolled_back = false;
                }
            }
        }

        match (attempted, all_rolled_back) {
            (0, true) => RunStatus::Failed,
            (_, true) => RunStatus::RolledBack,
            _ => RunStatus::RollbackFailed,
        }
    }

    /// Newest restorable deployment of the server older than `source`
    async fn previous_deployment(&self, source: &Deployment) -> Result<Option<Deployment>> {
        let deployments = self
            .engine
            .store
            .list_deployments(self.project.id, Some(&source.server_id))
            .await?;

        Ok(deployments.into_iter().find(|d| {
            d.id != source.id
                && d.is_successful()
                && d.has_artifact()
                && d.created_at < source.created_at
        }))
    }

    async fn snapshot_deployment(&self, server_id: &str, status: DeploymentStatus) -> Deployment {
        let migrations = match &self.project.migration_status_command {
            Some(command) => self
                .inspect(server_id, command)
                .await
                .map(|out| parse_migrations(&out))
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let files = match &self.project.manifest_command {
            Some(command) => self
                .inspect(server_id, command)
                .await
                .map(|out| parse_manifest(&out))
                .unwrap_or_default(),
            None => BTreeMap::new(),
        };

        let now = chrono::Utc::now();
        Deployment {
            id: Uuid::new_v4(),
            project_id: self.project.id,
            server_id: server_id.to_string(),
            run_id: Some(self.run.id),
            commit_sha: self.run.commit_sha.clone(),
            branch: self.run.branch.clone(),
            status,
            triggered_by: self.run.triggered_by.clone(),
            rollback_of: None,
            artifact_path: Some(self.project.release_path(&self.run.commit_sha)),
            migrations,
            files,
            environment_snapshot: self.project.environment.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Runs a read-only project command; None when it fails
    async fn inspect(&self, server_id: &str, command: &str) -> Option<String> {
        let vars = self.vars(server_id);
        let snapshot = StageSnapshot {
            name: "inspect".to_string(),
            commands: vec![vars.render(command)],
            timeout: self.engine.settings.inspect_timeout,
            env: layered_env([&self.project.environment, &vars.env()]),
        };

        let result = self
            .engine
            .executor
            .execute_stage(&snapshot, server_id, self.engine.channel.as_ref(), &NullSink)
            .await;

        match result.failure {
            None => Some(result.commands.into_iter().map(|c| c.stdout).collect()),
            Some(failure) => {
                warn!(
                    "Run {}: inspection '{}' failed on {}: {}",
                    self.run.id, command, server_id, failure.message
                );
                None
            }
        }
    }

    fn vars(&self, server_id: &str) -> CommandVars {
        CommandVars {
            project_slug: self.project.slug.clone(),
            project_path: self.project.deploy_path.clone(),
            branch: self.run.branch.clone(),
            commit_sha: self.run.commit_sha.clone(),
            run_number: self.run.run_number,
            server_id: server_id.to_string(),
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let store = self.engine.store.clone();
        let project_id = self.project.id;
        let run_id = self.run.id;
        let every = self.engine.settings.lock_heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat_lock(project_id, run_id).await {
                    Ok(true) => debug!("Run {} heartbeat", run_id),
                    Ok(false) => warn!("Run {} no longer holds the lock of project {}", run_id, project_id),
                    Err(e) => warn!("Run {} heartbeat failed: {}", run_id, e),
                }
            }
        })
    }

    async fn save_run(&self) {
        if let Err(e) = self.engine.store.update_run(&self.run).await {
            error!("Failed to persist run {}: {}", self.run.id, e);
        }
    }

    async fn save_stage(&self, index: usize) {
        let stage = &self.stages[index];
        if let Err(e) = self.engine.store.update_stage_run(stage).await {
            error!("Failed to persist stage run {} of run {}: {}", stage.id, self.run.id, e);
        }
    }
}

/// Stops the heartbeat and forgets the run however the worker ends
///
/// A worker that panics leaves its lock to go stale, so the sweeper can
/// reclaim it.
struct WorkerGuard {
    heartbeat: JoinHandle<()>,
    active: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
    run_id: Uuid,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.run_id);
        }
    }
}

/// Periodically moves buffered output of one stage run into the store
struct LogFlusher {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl LogFlusher {
    fn spawn(
        store: Arc<dyn Store>,
        stage_run_id: Uuid,
        buffer: InMemoryLogBuffer,
        every: Duration,
    ) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => flush_logs(store.as_ref(), stage_run_id, &buffer).await,
                }
            }
            flush_logs(store.as_ref(), stage_run_id, &buffer).await;
        });

        Self { stop, handle }
    }

    /// Stops the flusher after a final flush
    async fn finish(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

async fn flush_logs(store: &dyn Store, stage_run_id: Uuid, buffer: &InMemoryLogBuffer) {
    let entries = buffer.drain();
    if entries.is_empty() {
        return;
    }
    if let Err(e) = store.append_logs(stage_run_id, &entries).await {
        warn!(
            "Dropped {} log entries of stage run {}: {}",
            entries.len(),
            stage_run_id,
            e
        );
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// One migration name per non-empty line
fn parse_migrations(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// `<digest> <path>` lines into path -> digest
fn parse_manifest(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.trim().split_once(char::is_whitespace))
        .map(|(digest, path)| {
            (
                path.trim().trim_start_matches("./").to_string(),
                digest.to_string(),
            )
        })
        .filter(|(path, _)| !path.is_empty())
        .collect()
}
