//! Stage definition DTOs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::stage::StageType;

/// Request to create a stage definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStage {
    pub name: String,
    pub stage_type: StageType,
    pub order: i32,
    pub commands: Vec<String>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Partial update of a stage definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStage {
    pub name: Option<String>,
    pub stage_type: Option<StageType>,
    pub order: Option<i32>,
    pub commands: Option<Vec<String>>,
    pub timeout_seconds: Option<u64>,
    pub continue_on_failure: Option<bool>,
    pub enabled: Option<bool>,
    pub env_vars: Option<BTreeMap<String, String>>,
}

fn default_enabled() -> bool {
    true
}
