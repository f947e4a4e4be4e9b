//! Rollback DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::rollback::RollbackOptions;

/// Request to preview or execute a rollback to an earlier deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub project_id: Uuid,
    pub target_deployment_id: Uuid,
    /// Deployment to roll back from; defaults to the current deployment of the
    /// target's server
    #[serde(default)]
    pub source_deployment_id: Option<Uuid>,
    #[serde(flatten)]
    pub options: RollbackOptions,
    pub triggered_by: String,
}
