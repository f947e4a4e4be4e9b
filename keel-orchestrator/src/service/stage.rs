//! Stage Service
//!
//! Business logic for stage definition management. Edits never affect runs
//! already started; those work on snapshots.

use keel_core::domain::stage::StageDefinition;
use keel_core::dto::stage::{CreateStage, UpdateStage};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};

/// Upper bound on a stage timeout (one day)
pub const MAX_TIMEOUT_SECONDS: u64 = 86_400;

/// Create a stage definition for a project
pub async fn create_stage(engine: &Engine, project_id: Uuid, req: CreateStage) -> Result<StageDefinition> {
    engine.project(project_id)?;

    let now = chrono::Utc::now();
    let stage = StageDefinition {
        id: Uuid::new_v4(),
        project_id,
        name: req.name.trim().to_string(),
        stage_type: req.stage_type,
        order: req.order,
        commands: req.commands,
        timeout_seconds: req.timeout_seconds,
        continue_on_failure: req.continue_on_failure,
        enabled: req.enabled,
        env_vars: req.env_vars,
        created_at: now,
        updated_at: now,
    };

    validate_stage(&stage)?;
    ensure_order_free(engine, &stage).await?;

    engine.store.create_stage(&stage).await?;

    tracing::info!(
        "Stage created: {} ({}) {}#{} for project {}",
        stage.name,
        stage.id,
        stage.stage_type,
        stage.order,
        project_id
    );

    Ok(stage)
}

/// Get a stage definition by ID
pub async fn get_stage(engine: &Engine, id: Uuid) -> Result<StageDefinition> {
    engine
        .store
        .find_stage(id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Stage {}", id)))
}

/// List the stages of a project in execution order
pub async fn list_stages(engine: &Engine, project_id: Uuid) -> Result<Vec<StageDefinition>> {
    engine.project(project_id)?;
    Ok(engine.store.list_stages(project_id).await?)
}

/// Apply a partial update to a stage definition
pub async fn update_stage(engine: &Engine, id: Uuid, req: UpdateStage) -> Result<StageDefinition> {
    let mut stage = get_stage(engine, id).await?;

    if let Some(name) = req.name {
        stage.name = name.trim().to_string();
    }
    if let Some(stage_type) = req.stage_type {
        stage.stage_type = stage_type;
    }
    if let Some(order) = req.order {
        stage.order = order;
    }
    if let Some(commands) = req.commands {
        stage.commands = commands;
    }
    if let Some(timeout_seconds) = req.timeout_seconds {
        stage.timeout_seconds = timeout_seconds;
    }
    if let Some(continue_on_failure) = req.continue_on_failure {
        stage.continue_on_failure = continue_on_failure;
    }
    if let Some(enabled) = req.enabled {
        stage.enabled = enabled;
    }
    if let Some(env_vars) = req.env_vars {
        stage.env_vars = env_vars;
    }
    stage.updated_at = chrono::Utc::now();

    validate_stage(&stage)?;
    ensure_order_free(engine, &stage).await?;

    if !engine.store.update_stage(&stage).await? {
        return Err(EngineError::NotFound(format!("Stage {}", id)));
    }

    tracing::info!("Stage updated: {} ({})", stage.name, stage.id);

    Ok(stage)
}

/// Delete a stage definition
pub async fn delete_stage(engine: &Engine, id: Uuid) -> Result<()> {
    if !engine.store.delete_stage(id).await? {
        return Err(EngineError::NotFound(format!("Stage {}", id)));
    }

    tracing::info!("Stage deleted: {}", id);

    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

fn validate_stage(stage: &StageDefinition) -> Result<()> {
    if stage.name.is_empty() {
        return Err(EngineError::Validation("Stage name cannot be empty".to_string()));
    }

    if stage.name.len() > 255 {
        return Err(EngineError::Validation(
            "Stage name is too long (max 255 characters)".to_string(),
        ));
    }

    if stage.commands.is_empty() {
        return Err(EngineError::Validation(format!(
            "Stage '{}' needs at least one command",
            stage.name
        )));
    }

    if stage.commands.iter().any(|c| c.trim().is_empty()) {
        return Err(EngineError::Validation(format!(
            "Stage '{}' has an empty command",
            stage.name
        )));
    }

    if stage.timeout_seconds == 0 {
        return Err(EngineError::Validation(
            "timeout_seconds must be greater than 0".to_string(),
        ));
    }

    if stage.timeout_seconds > MAX_TIMEOUT_SECONDS {
        return Err(EngineError::Validation(format!(
            "timeout_seconds must be at most {}",
            MAX_TIMEOUT_SECONDS
        )));
    }

    if let Some(key) = stage.env_vars.keys().find(|k| !is_shell_identifier(k)) {
        return Err(EngineError::Validation(format!(
            "Invalid environment variable name '{}'",
            key
        )));
    }

    Ok(())
}

/// `order` is unique within (project, stage type)
async fn ensure_order_free(engine: &Engine, stage: &StageDefinition) -> Result<()> {
    let taken = engine
        .store
        .list_stages(stage.project_id)
        .await?
        .into_iter()
        .any(|other| {
            other.id != stage.id
                && other.stage_type == stage.stage_type
                && other.order == stage.order
        });

    if taken {
        return Err(EngineError::Validation(format!(
            "A {} stage with order {} already exists",
            stage.stage_type, stage.order
        )));
    }

    Ok(())
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
