//! Repository Module
//!
//! Persistence boundary of the engine. Stores are trait-based so the engine
//! runs against Postgres in production and against memory in tests.
//!
//! - `StageDefinitionStore`: stage configuration per project
//! - `RunHistoryStore`: runs, stage runs, logs, deployments, rollback records
//! - `RunLockStore`: per-project run locks with heartbeats

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use keel_core::domain::log::LogEntry;
use keel_core::domain::rollback::RollbackRecord;
use keel_core::domain::run::{PipelineRun, PipelineStageRun};
use keel_core::domain::stage::StageDefinition;
use keel_core::dto::page::Page;
use keel_core::dto::run::RunFilter;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Missing record: {0}")]
    Missing(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Stage definition persistence
#[async_trait]
pub trait StageDefinitionStore: Send + Sync {
    async fn create_stage(&self, stage: &StageDefinition) -> Result<()>;

    /// Returns false when the stage does not exist
    async fn update_stage(&self, stage: &StageDefinition) -> Result<bool>;

    /// Returns false when the stage does not exist
    async fn delete_stage(&self, id: Uuid) -> Result<bool>;

    async fn find_stage(&self, id: Uuid) -> Result<Option<StageDefinition>>;

    /// All stages of a project in execution order
    async fn list_stages(&self, project_id: Uuid) -> Result<Vec<StageDefinition>>;
}

/// Run, deployment and rollback history
#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Allocates the next run number of a project
    ///
    /// Numbers strictly increase and are never handed out twice, even when the
    /// run they were allocated for is never created.
    async fn next_run_number(&self, project_id: Uuid) -> Result<i64>;

    /// Inserts a run together with its stage run snapshots, atomically
    async fn create_run(&self, run: &PipelineRun, stages: &[PipelineStageRun]) -> Result<()>;

    async fn update_run(&self, run: &PipelineRun) -> Result<()>;

    async fn find_run(&self, id: Uuid) -> Result<Option<PipelineRun>>;

    /// Runs of a project matching the filter, newest first
    async fn list_runs(&self, project_id: Uuid, filter: &RunFilter) -> Result<Page<PipelineRun>>;

    async fn update_stage_run(&self, stage: &PipelineStageRun) -> Result<()>;

    /// Stage runs of a run in execution order
    async fn list_stage_runs(&self, run_id: Uuid) -> Result<Vec<PipelineStageRun>>;

    async fn append_logs(&self, stage_run_id: Uuid, entries: &[LogEntry]) -> Result<()>;

    /// Log entries of a stage run in emission order
    async fn list_logs(&self, stage_run_id: Uuid) -> Result<Vec<LogEntry>>;

    /// Appends a deployment row without touching other rows
    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Makes `deployment` the current one of its (project, server), atomically
    ///
    /// `undone` is marked `rolled_back`; any other current row of the same
    /// server becomes `superseded`.
    async fn promote_deployment(&self, deployment: &Deployment, undone: Option<Uuid>) -> Result<()>;

    async fn update_deployment_status(&self, id: Uuid, status: DeploymentStatus) -> Result<()>;

    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>>;

    async fn current_deployment(&self, project_id: Uuid, server_id: &str) -> Result<Option<Deployment>>;

    /// Deployments of a project, newest first
    async fn list_deployments(&self, project_id: Uuid, server_id: Option<&str>) -> Result<Vec<Deployment>>;

    async fn create_rollback_record(&self, record: &RollbackRecord) -> Result<()>;

    /// Rollback records of a project, newest first
    async fn list_rollback_records(&self, project_id: Uuid) -> Result<Vec<RollbackRecord>>;
}

/// A run lock that was reclaimed by the stale sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimedLock {
    pub project_id: Uuid,
    pub run_id: Uuid,
}

/// Per-project run locks
///
/// A lock is held by exactly one run. Holders heartbeat periodically; locks
/// whose heartbeat is older than the stale threshold are reclaimed.
#[async_trait]
pub trait RunLockStore: Send + Sync {
    /// Claims the project's lock for `run_id`; false if another run holds it
    async fn try_acquire_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<bool>;

    /// Refreshes the heartbeat; false if `run_id` no longer holds the lock
    async fn heartbeat_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<bool>;

    /// Releases the lock if `run_id` holds it
    async fn release_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<()>;

    /// Removes locks whose last heartbeat is older than `stale_after`
    async fn sweep_stale_locks(&self, stale_after: Duration) -> Result<Vec<ReclaimedLock>>;
}

/// Everything the engine persists
pub trait Store: StageDefinitionStore + RunHistoryStore + RunLockStore {}

impl<T> Store for T where T: StageDefinitionStore + RunHistoryStore + RunLockStore {}

/// Sorts stages into execution order
pub(crate) fn sort_stages(stages: &mut [StageDefinition]) {
    stages.sort_by_key(|stage| (stage.execution_key(), stage.created_at));
}
