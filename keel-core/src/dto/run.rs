//! Pipeline run DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::RunStatus;

/// Normalized trigger for a pipeline run
///
/// Webhook, schedule and manual triggers are all parsed upstream into this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRun {
    pub project_id: Uuid,
    pub branch: String,
    pub commit_sha: String,
    pub triggered_by: String,
}

/// Filters for listing runs of a project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub branch: Option<String>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
}
