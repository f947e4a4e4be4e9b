//! Stage domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Deployment phase a stage belongs to
///
/// Phases always execute in declaration order: every `PreDeploy` stage,
/// then every `Deploy` stage, then every `PostDeploy` stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    PreDeploy,
    Deploy,
    PostDeploy,
}

impl StageType {
    /// All phases in execution order
    pub const PHASES: [StageType; 3] = [StageType::PreDeploy, StageType::Deploy, StageType::PostDeploy];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::PreDeploy => "pre_deploy",
            StageType::Deploy => "deploy",
            StageType::PostDeploy => "post_deploy",
        }
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_deploy" => Ok(StageType::PreDeploy),
            "deploy" => Ok(StageType::Deploy),
            "post_deploy" => Ok(StageType::PostDeploy),
            other => Err(format!("unknown stage type '{}'", other)),
        }
    }
}

/// Stage definition
///
/// Owned by a project and edited only through the stage definition service.
/// Runs never read this directly once started; they work on a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub stage_type: StageType,
    pub order: i32,
    pub commands: Vec<String>,
    pub timeout_seconds: u64,
    pub continue_on_failure: bool,
    pub enabled: bool,
    pub env_vars: BTreeMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl StageDefinition {
    /// Sort key giving the deterministic execution position of a stage
    pub fn execution_key(&self) -> (StageType, i32) {
        (self.stage_type, self.order)
    }
}
