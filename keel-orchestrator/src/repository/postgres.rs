//! Postgres store
//!
//! sqlx implementation of every store trait. Collections are stored as JSONB,
//! enums as their snake_case names.

use async_trait::async_trait;
use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use keel_core::domain::log::{LogEntry, LogLevel, LogStream};
use keel_core::domain::rollback::{RollbackRecord, RollbackStatus, ServerRollbackOutcome};
use keel_core::domain::run::{
    CommandResult, FailureKind, PipelineRun, PipelineStageRun, RunStatus, StageRunStatus,
};
use keel_core::domain::stage::{StageDefinition, StageType};
use keel_core::dto::page::{self, Page};
use keel_core::dto::run::RunFilter;
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::{
    ReclaimedLock, Result, RunHistoryStore, RunLockStore, StageDefinitionStore, sort_stages,
};

/// Store backed by a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const STAGE_COLUMNS: &str = "id, project_id, name, stage_type, stage_order, commands, timeout_seconds, \
     continue_on_failure, enabled, env_vars, created_at, updated_at";

const RUN_COLUMNS: &str = "id, project_id, run_number, branch, commit_sha, triggered_by, status, \
     error_message, created_at, started_at, completed_at";

const STAGE_RUN_COLUMNS: &str = "id, run_id, stage_id, name, stage_type, stage_order, commands, \
     timeout_seconds, continue_on_failure, env_vars, status, server_id, exit_code, output, failure, \
     error_message, command_results, started_at, completed_at, duration_seconds";

const DEPLOYMENT_COLUMNS: &str = "id, project_id, server_id, run_id, commit_sha, branch, status, \
     triggered_by, rollback_of, artifact_path, migrations, files, environment_snapshot, created_at, \
     updated_at";

const RUN_FILTER: &str = "project_id = $1 \
     AND ($2::VARCHAR IS NULL OR status = $2) \
     AND ($3::VARCHAR IS NULL OR branch = $3) \
     AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4) \
     AND ($5::TIMESTAMPTZ IS NULL OR created_at <= $5)";

#[async_trait]
impl StageDefinitionStore for PgStore {
    async fn create_stage(&self, stage: &StageDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_definitions (id, project_id, name, stage_type, stage_order, commands,
                timeout_seconds, continue_on_failure, enabled, env_vars, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(stage.id)
        .bind(stage.project_id)
        .bind(&stage.name)
        .bind(stage.stage_type.as_str())
        .bind(stage.order)
        .bind(Json(&stage.commands))
        .bind(i64::try_from(stage.timeout_seconds).unwrap_or(i64::MAX))
        .bind(stage.continue_on_failure)
        .bind(stage.enabled)
        .bind(Json(&stage.env_vars))
        .bind(stage.created_at)
        .bind(stage.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_stage(&self, stage: &StageDefinition) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stage_definitions
            SET name = $1, stage_type = $2, stage_order = $3, commands = $4, timeout_seconds = $5,
                continue_on_failure = $6, enabled = $7, env_vars = $8, updated_at = $9
            WHERE id = $10
            "#,
        )
        .bind(&stage.name)
        .bind(stage.stage_type.as_str())
        .bind(stage.order)
        .bind(Json(&stage.commands))
        .bind(i64::try_from(stage.timeout_seconds).unwrap_or(i64::MAX))
        .bind(stage.continue_on_failure)
        .bind(stage.enabled)
        .bind(Json(&stage.env_vars))
        .bind(stage.updated_at)
        .bind(stage.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_stage(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM stage_definitions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stage(&self, id: Uuid) -> Result<Option<StageDefinition>> {
        let sql = format!("SELECT {} FROM stage_definitions WHERE id = $1", STAGE_COLUMNS);
        let row = sqlx::query_as::<_, StageRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_stages(&self, project_id: Uuid) -> Result<Vec<StageDefinition>> {
        let sql = format!(
            "SELECT {} FROM stage_definitions WHERE project_id = $1",
            STAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, StageRow>(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        // Phase order is not alphabetical; sort in Rust
        let mut stages: Vec<StageDefinition> = rows.into_iter().map(|r| r.into()).collect();
        sort_stages(&mut stages);
        Ok(stages)
    }
}

#[async_trait]
impl RunHistoryStore for PgStore {
    async fn next_run_number(&self, project_id: Uuid) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO project_run_counters (project_id, last_run_number)
            VALUES ($1, 1)
            ON CONFLICT (project_id) DO UPDATE
                SET last_run_number = project_run_counters.last_run_number + 1
            RETURNING last_run_number
            "#,
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn create_run(&self, run: &PipelineRun, stages: &[PipelineStageRun]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, project_id, run_number, branch, commit_sha, triggered_by,
                status, error_message, created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(run.project_id)
        .bind(run.run_number)
        .bind(&run.branch)
        .bind(&run.commit_sha)
        .bind(&run.triggered_by)
        .bind(run_status_to_string(run.status))
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&mut *tx)
        .await?;

        for (position, stage) in stages.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO pipeline_stage_runs (id, run_id, position, stage_id, name, stage_type,
                    stage_order, commands, timeout_seconds, continue_on_failure, env_vars, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(stage.id)
            .bind(stage.run_id)
            .bind(position as i32)
            .bind(stage.stage_id)
            .bind(&stage.name)
            .bind(stage.stage_type.as_str())
            .bind(stage.order)
            .bind(Json(&stage.commands))
            .bind(i64::try_from(stage.timeout_seconds).unwrap_or(i64::MAX))
            .bind(stage.continue_on_failure)
            .bind(Json(&stage.env_vars))
            .bind(stage_run_status_to_string(stage.status))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $1, error_message = $2, started_at = $3, completed_at = $4
            WHERE id = $5
            "#,
        )
        .bind(run_status_to_string(run.status))
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_run(&self, id: Uuid) -> Result<Option<PipelineRun>> {
        let sql = format!("SELECT {} FROM pipeline_runs WHERE id = $1", RUN_COLUMNS);
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_runs(&self, project_id: Uuid, filter: &RunFilter) -> Result<Page<PipelineRun>> {
        let (page, per_page) = page::normalize(filter.page, filter.per_page);
        let status = filter.status.map(run_status_to_string);

        let count_sql = format!("SELECT COUNT(*) FROM pipeline_runs WHERE {}", RUN_FILTER);
        let total: (i64,) = sqlx::query_as(&count_sql)
            .bind(project_id)
            .bind(status)
            .bind(filter.branch.as_deref())
            .bind(filter.from)
            .bind(filter.to)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT {} FROM pipeline_runs WHERE {} ORDER BY run_number DESC LIMIT $6 OFFSET $7",
            RUN_COLUMNS, RUN_FILTER
        );
        let rows = sqlx::query_as::<_, RunRow>(&sql)
            .bind(project_id)
            .bind(status)
            .bind(filter.branch.as_deref())
            .bind(filter.from)
            .bind(filter.to)
            .bind(i64::from(per_page))
            .bind(Page::<PipelineRun>::offset(page, per_page) as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            items: rows.into_iter().map(|r| r.into()).collect(),
            page,
            per_page,
            total: total.0.max(0) as u64,
        })
    }

    async fn update_stage_run(&self, stage: &PipelineStageRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_stage_runs
            SET status = $1, server_id = $2, exit_code = $3, output = $4, failure = $5,
                error_message = $6, command_results = $7, started_at = $8, completed_at = $9,
                duration_seconds = $10
            WHERE id = $11
            "#,
        )
        .bind(stage_run_status_to_string(stage.status))
        .bind(&stage.server_id)
        .bind(stage.exit_code)
        .bind(&stage.output)
        .bind(stage.failure.map(failure_to_string))
        .bind(&stage.error_message)
        .bind(Json(&stage.command_results))
        .bind(stage.started_at)
        .bind(stage.completed_at)
        .bind(stage.duration_seconds)
        .bind(stage.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_stage_runs(&self, run_id: Uuid) -> Result<Vec<PipelineStageRun>> {
        let sql = format!(
            "SELECT {} FROM pipeline_stage_runs WHERE run_id = $1 ORDER BY position ASC",
            STAGE_RUN_COLUMNS
        );
        let rows = sqlx::query_as::<_, StageRunRow>(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn append_logs(&self, stage_run_id: Uuid, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO stage_run_logs (stage_run_id, timestamp, level, stream, message)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(stage_run_id)
            .bind(entry.timestamp)
            .bind(level_to_string(entry.level))
            .bind(stream_to_string(entry.stream))
            .bind(&entry.message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn list_logs(&self, stage_run_id: Uuid) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT timestamp, level, stream, message
            FROM stage_run_logs
            WHERE stage_run_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(stage_run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        insert_deployment(&self.pool, deployment).await
    }

    async fn promote_deployment(&self, deployment: &Deployment, undone: Option<Uuid>) -> Result<()> {
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await?;

        if let Some(undone) = undone {
            sqlx::query("UPDATE deployments SET status = $1, updated_at = $2 WHERE id = $3")
                .bind(deployment_status_to_string(DeploymentStatus::RolledBack))
                .bind(now)
                .bind(undone)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, updated_at = $2
            WHERE project_id = $3 AND server_id = $4 AND status = $5
            "#,
        )
        .bind(deployment_status_to_string(DeploymentStatus::Superseded))
        .bind(now)
        .bind(deployment.project_id)
        .bind(&deployment.server_id)
        .bind(deployment_status_to_string(DeploymentStatus::Current))
        .execute(&mut *tx)
        .await?;

        insert_deployment(&mut *tx, deployment).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_deployment_status(&self, id: Uuid, status: DeploymentStatus) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(deployment_status_to_string(status))
            .bind(chrono::Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        let sql = format!("SELECT {} FROM deployments WHERE id = $1", DEPLOYMENT_COLUMNS);
        let row = sqlx::query_as::<_, DeploymentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn current_deployment(&self, project_id: Uuid, server_id: &str) -> Result<Option<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE project_id = $1 AND server_id = $2 AND status = $3",
            DEPLOYMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, DeploymentRow>(&sql)
            .bind(project_id)
            .bind(server_id)
            .bind(deployment_status_to_string(DeploymentStatus::Current))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_deployments(&self, project_id: Uuid, server_id: Option<&str>) -> Result<Vec<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments \
             WHERE project_id = $1 AND ($2::VARCHAR IS NULL OR server_id = $2) \
             ORDER BY created_at DESC",
            DEPLOYMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeploymentRow>(&sql)
            .bind(project_id)
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn create_rollback_record(&self, record: &RollbackRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rollback_records (id, project_id, plan_id, run_id, source_deployment_id,
                target_deployment_id, include_database, include_files, server_ids, dry_run, status,
                server_outcomes, error_message, triggered_by, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(record.id)
        .bind(record.project_id)
        .bind(record.plan_id)
        .bind(record.run_id)
        .bind(record.source_deployment_id)
        .bind(record.target_deployment_id)
        .bind(record.include_database)
        .bind(record.include_files)
        .bind(Json(&record.server_ids))
        .bind(record.dry_run)
        .bind(rollback_status_to_string(record.status))
        .bind(Json(&record.server_outcomes))
        .bind(&record.error_message)
        .bind(&record.triggered_by)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_rollback_records(&self, project_id: Uuid) -> Result<Vec<RollbackRecord>> {
        let rows = sqlx::query_as::<_, RollbackRow>(
            r#"
            SELECT id, project_id, plan_id, run_id, source_deployment_id, target_deployment_id,
                   include_database, include_files, server_ids, dry_run, status, server_outcomes,
                   error_message, triggered_by, started_at, completed_at
            FROM rollback_records
            WHERE project_id = $1
            ORDER BY started_at DESC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

#[async_trait]
impl RunLockStore for PgStore {
    async fn try_acquire_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<bool> {
        let now = chrono::Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO run_locks (project_id, run_id, acquired_at, heartbeat_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (project_id) DO NOTHING
            "#,
        )
        .bind(project_id)
        .bind(run_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE run_locks SET heartbeat_at = $1 WHERE project_id = $2 AND run_id = $3",
        )
        .bind(chrono::Utc::now())
        .bind(project_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM run_locks WHERE project_id = $1 AND run_id = $2")
            .bind(project_id)
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn sweep_stale_locks(&self, stale_after: Duration) -> Result<Vec<ReclaimedLock>> {
        let Some(cutoff) = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };

        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "DELETE FROM run_locks WHERE heartbeat_at <= $1 RETURNING project_id, run_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(project_id, run_id)| ReclaimedLock { project_id, run_id })
            .collect())
    }
}

async fn insert_deployment<'e, E>(executor: E, deployment: &Deployment) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO deployments (id, project_id, server_id, run_id, commit_sha, branch, status,
            triggered_by, rollback_of, artifact_path, migrations, files, environment_snapshot,
            created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(deployment.id)
    .bind(deployment.project_id)
    .bind(&deployment.server_id)
    .bind(deployment.run_id)
    .bind(&deployment.commit_sha)
    .bind(&deployment.branch)
    .bind(deployment_status_to_string(deployment.status))
    .bind(&deployment.triggered_by)
    .bind(deployment.rollback_of)
    .bind(&deployment.artifact_path)
    .bind(Json(&deployment.migrations))
    .bind(Json(&deployment.files))
    .bind(Json(&deployment.environment_snapshot))
    .bind(deployment.created_at)
    .bind(deployment.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn run_status_to_string(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Success => "success",
        RunStatus::Failed => "failed",
        RunStatus::RolledBack => "rolled_back",
        RunStatus::RollbackFailed => "rollback_failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn string_to_run_status(s: &str) -> RunStatus {
    match s {
        "pending" => RunStatus::Pending,
        "running" => RunStatus::Running,
        "success" => RunStatus::Success,
        "rolled_back" => RunStatus::RolledBack,
        "rollback_failed" => RunStatus::RollbackFailed,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    }
}

fn stage_run_status_to_string(status: StageRunStatus) -> &'static str {
    match status {
        StageRunStatus::Pending => "pending",
        StageRunStatus::Running => "running",
        StageRunStatus::Success => "success",
        StageRunStatus::Failed => "failed",
        StageRunStatus::Skipped => "skipped",
    }
}

fn string_to_stage_run_status(s: &str) -> StageRunStatus {
    match s {
        "pending" => StageRunStatus::Pending,
        "running" => StageRunStatus::Running,
        "success" => StageRunStatus::Success,
        "skipped" => StageRunStatus::Skipped,
        _ => StageRunStatus::Failed,
    }
}

fn failure_to_string(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::ConnectionError => "ConnectionError",
        FailureKind::Timeout => "Timeout",
        FailureKind::ExecutionError => "ExecutionError",
    }
}

fn string_to_failure(s: &str) -> FailureKind {
    match s {
        "ConnectionError" => FailureKind::ConnectionError,
        "Timeout" => FailureKind::Timeout,
        _ => FailureKind::ExecutionError,
    }
}

fn deployment_status_to_string(status: DeploymentStatus) -> &'static str {
    match status {
        DeploymentStatus::Current => "current",
        DeploymentStatus::Superseded => "superseded",
        DeploymentStatus::RolledBack => "rolled_back",
        DeploymentStatus::Failed => "failed",
    }
}

fn string_to_deployment_status(s: &str) -> DeploymentStatus {
    match s {
        "current" => DeploymentStatus::Current,
        "superseded" => DeploymentStatus::Superseded,
        "rolled_back" => DeploymentStatus::RolledBack,
        _ => DeploymentStatus::Failed,
    }
}

fn rollback_status_to_string(status: RollbackStatus) -> &'static str {
    match status {
        RollbackStatus::RolledBack => "rolled_back",
        RollbackStatus::RollbackFailed => "rollback_failed",
        RollbackStatus::Cancelled => "cancelled",
    }
}

fn string_to_rollback_status(s: &str) -> RollbackStatus {
    match s {
        "rolled_back" => RollbackStatus::RolledBack,
        "cancelled" => RollbackStatus::Cancelled,
        _ => RollbackStatus::RollbackFailed,
    }
}

fn level_to_string(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warning",
        LogLevel::Error => "error",
    }
}

fn string_to_level(s: &str) -> LogLevel {
    match s {
        "debug" => LogLevel::Debug,
        "warning" => LogLevel::Warning,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn stream_to_string(stream: LogStream) -> &'static str {
    match stream {
        LogStream::Stdout => "stdout",
        LogStream::Stderr => "stderr",
        LogStream::System => "system",
    }
}

fn string_to_stream(s: &str) -> LogStream {
    match s {
        "stdout" => LogStream::Stdout,
        "stderr" => LogStream::Stderr,
        _ => LogStream::System,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StageRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    stage_type: String,
    stage_order: i32,
    commands: Json<Vec<String>>,
    timeout_seconds: i64,
    continue_on_failure: bool,
    enabled: bool,
    env_vars: Json<BTreeMap<String, String>>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<StageRow> for StageDefinition {
    fn from(row: StageRow) -> Self {
        StageDefinition {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            stage_type: row.stage_type.parse().unwrap_or(StageType::Deploy),
            order: row.stage_order,
            commands: row.commands.0,
            timeout_seconds: row.timeout_seconds.max(0) as u64,
            continue_on_failure: row.continue_on_failure,
            enabled: row.enabled,
            env_vars: row.env_vars.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    project_id: Uuid,
    run_number: i64,
    branch: String,
    commit_sha: String,
    triggered_by: String,
    status: String,
    error_message: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<RunRow> for PipelineRun {
    fn from(row: RunRow) -> Self {
        PipelineRun {
            id: row.id,
            project_id: row.project_id,
            run_number: row.run_number,
            branch: row.branch,
            commit_sha: row.commit_sha,
            triggered_by: row.triggered_by,
            status: string_to_run_status(&row.status),
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StageRunRow {
    id: Uuid,
    run_id: Uuid,
    stage_id: Uuid,
    name: String,
    stage_type: String,
    stage_order: i32,
    commands: Json<Vec<String>>,
    timeout_seconds: i64,
    continue_on_failure: bool,
    env_vars: Json<BTreeMap<String, String>>,
    status: String,
    server_id: Option<String>,
    exit_code: Option<i32>,
    output: String,
    failure: Option<String>,
    error_message: Option<String>,
    command_results: Json<Vec<CommandResult>>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    duration_seconds: Option<i64>,
}

impl From<StageRunRow> for PipelineStageRun {
    fn from(row: StageRunRow) -> Self {
        PipelineStageRun {
            id: row.id,
            run_id: row.run_id,
            stage_id: row.stage_id,
            name: row.name,
            stage_type: row.stage_type.parse().unwrap_or(StageType::Deploy),
            order: row.stage_order,
            commands: row.commands.0,
            timeout_seconds: row.timeout_seconds.max(0) as u64,
            continue_on_failure: row.continue_on_failure,
            env_vars: row.env_vars.0,
            status: string_to_stage_run_status(&row.status),
            server_id: row.server_id,
            exit_code: row.exit_code,
            output: row.output,
            failure: row.failure.as_deref().map(string_to_failure),
            error_message: row.error_message,
            command_results: row.command_results.0,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_seconds: row.duration_seconds,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: chrono::DateTime<chrono::Utc>,
    level: String,
    stream: String,
    message: String,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        LogEntry {
            timestamp: row.timestamp,
            level: string_to_level(&row.level),
            stream: string_to_stream(&row.stream),
            message: row.message,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: Uuid,
    project_id: Uuid,
    server_id: String,
    run_id: Option<Uuid>,
    commit_sha: String,
    branch: String,
    status: String,
    triggered_by: String,
    rollback_of: Option<Uuid>,
    artifact_path: Option<String>,
    migrations: Json<Vec<String>>,
    files: Json<BTreeMap<String, String>>,
    environment_snapshot: Json<BTreeMap<String, String>>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<DeploymentRow> for Deployment {
    fn from(row: DeploymentRow) -> Self {
        Deployment {
            id: row.id,
            project_id: row.project_id,
            server_id: row.server_id,
            run_id: row.run_id,
            commit_sha: row.commit_sha,
            branch: row.branch,
            status: string_to_deployment_status(&row.status),
            triggered_by: row.triggered_by,
            rollback_of: row.rollback_of,
            artifact_path: row.artifact_path,
            migrations: row.migrations.0,
            files: row.files.0,
            environment_snapshot: row.environment_snapshot.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RollbackRow {
    id: Uuid,
    project_id: Uuid,
    plan_id: Uuid,
    run_id: Option<Uuid>,
    source_deployment_id: Uuid,
    target_deployment_id: Uuid,
    include_database: bool,
    include_files: bool,
    server_ids: Json<Vec<String>>,
    dry_run: bool,
    status: String,
    server_outcomes: Json<Vec<ServerRollbackOutcome>>,
    error_message: Option<String>,
    triggered_by: String,
    started_at: chrono::DateTime<chrono::Utc>,
    completed_at: chrono::DateTime<chrono::Utc>,
}

impl From<RollbackRow> for RollbackRecord {
    fn from(row: RollbackRow) -> Self {
        RollbackRecord {
            id: row.id,
            project_id: row.project_id,
            plan_id: row.plan_id,
            run_id: row.run_id,
            source_deployment_id: row.source_deployment_id,
            target_deployment_id: row.target_deployment_id,
            include_database: row.include_database,
            include_files: row.include_files,
            server_ids: row.server_ids.0,
            dry_run: row.dry_run,
            status: string_to_rollback_status(&row.status),
            server_outcomes: row.server_outcomes.0,
            error_message: row.error_message,
            triggered_by: row.triggered_by,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_match_serde_names() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::RolledBack,
            RunStatus::RollbackFailed,
            RunStatus::Cancelled,
        ] {
            let serde_name = serde_json::to_value(status).unwrap();
            assert_eq!(serde_name, run_status_to_string(status));
            assert_eq!(string_to_run_status(run_status_to_string(status)), status);
        }

        for status in [
            DeploymentStatus::Current,
            DeploymentStatus::Superseded,
            DeploymentStatus::RolledBack,
            DeploymentStatus::Failed,
        ] {
            assert_eq!(
                string_to_deployment_status(deployment_status_to_string(status)),
                status
            );
        }
    }

    #[test]
    fn test_failure_strings() {
        for kind in [
            FailureKind::ConnectionError,
            FailureKind::Timeout,
            FailureKind::ExecutionError,
        ] {
            assert_eq!(failure_to_string(kind), kind.to_string());
            assert_eq!(string_to_failure(failure_to_string(kind)), kind);
        }
    }
}
