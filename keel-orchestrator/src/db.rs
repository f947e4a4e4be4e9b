//! Database setup
//!
//! Connection pool creation and idempotent schema migrations.

use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Stage definitions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_definitions (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            name VARCHAR(255) NOT NULL,
            stage_type VARCHAR(20) NOT NULL,
            stage_order INTEGER NOT NULL,
            commands JSONB NOT NULL DEFAULT '[]',
            timeout_seconds BIGINT NOT NULL,
            continue_on_failure BOOLEAN NOT NULL DEFAULT FALSE,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            env_vars JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_stage_definitions_order ON stage_definitions(project_id, stage_type, stage_order)",
    )
    .execute(pool)
    .await?;

    // Runs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            run_number BIGINT NOT NULL,
            branch VARCHAR(255) NOT NULL,
            commit_sha VARCHAR(64) NOT NULL,
            triggered_by VARCHAR(255) NOT NULL,
            status VARCHAR(50) NOT NULL,
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            UNIQUE (project_id, run_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_run_counters (
            project_id UUID PRIMARY KEY,
            last_run_number BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_stage_runs (
            id UUID PRIMARY KEY,
            run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            stage_id UUID NOT NULL,
            name VARCHAR(255) NOT NULL,
            stage_type VARCHAR(20) NOT NULL,
            stage_order INTEGER NOT NULL,
            commands JSONB NOT NULL,
            timeout_seconds BIGINT NOT NULL,
            continue_on_failure BOOLEAN NOT NULL,
            env_vars JSONB NOT NULL DEFAULT '{}',
            status VARCHAR(20) NOT NULL,
            server_id VARCHAR(255),
            exit_code INTEGER,
            output TEXT NOT NULL DEFAULT '',
            failure VARCHAR(50),
            error_message TEXT,
            command_results JSONB NOT NULL DEFAULT '[]',
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            duration_seconds BIGINT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_run_logs (
            id BIGSERIAL PRIMARY KEY,
            stage_run_id UUID NOT NULL REFERENCES pipeline_stage_runs(id) ON DELETE CASCADE,
            timestamp TIMESTAMPTZ NOT NULL,
            level VARCHAR(20) NOT NULL,
            stream VARCHAR(20) NOT NULL,
            message TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Deployments and rollbacks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            server_id VARCHAR(255) NOT NULL,
            run_id UUID,
            commit_sha VARCHAR(64) NOT NULL,
            branch VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            triggered_by VARCHAR(255) NOT NULL,
            rollback_of UUID,
            artifact_path TEXT,
            migrations JSONB NOT NULL DEFAULT '[]',
            files JSONB NOT NULL DEFAULT '{}',
            environment_snapshot JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one current deployment per (project, server)
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_current ON deployments(project_id, server_id) WHERE status = 'current'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rollback_records (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            plan_id UUID NOT NULL,
            run_id UUID,
            source_deployment_id UUID NOT NULL,
            target_deployment_id UUID NOT NULL,
            include_database BOOLEAN NOT NULL,
            include_files BOOLEAN NOT NULL,
            server_ids JSONB NOT NULL DEFAULT '[]',
            dry_run BOOLEAN NOT NULL DEFAULT FALSE,
            status VARCHAR(20) NOT NULL,
            server_outcomes JSONB NOT NULL DEFAULT '[]',
            error_message TEXT,
            triggered_by VARCHAR(255) NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_locks (
            project_id UUID PRIMARY KEY,
            run_id UUID NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL,
            heartbeat_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for history queries
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_project ON pipeline_runs(project_id, run_number DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stage_runs_run ON pipeline_stage_runs(run_id, position)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stage_run_logs_stage ON stage_run_logs(stage_run_id, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deployments_project ON deployments(project_id, server_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_rollback_records_project ON rollback_records(project_id, started_at DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
