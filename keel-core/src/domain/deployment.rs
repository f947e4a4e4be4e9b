//! Deployment domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A commit+branch applied to one server
///
/// Rows form an append-only log: once written, only `status` changes.
/// At most one row per (project, server) is `Current`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub server_id: String,
    /// Run that produced this deployment (None for rollback-created rows)
    pub run_id: Option<Uuid>,
    pub commit_sha: String,
    pub branch: String,
    pub status: DeploymentStatus,
    pub triggered_by: String,
    /// Deployment whose content this row restored, when created by a rollback
    pub rollback_of: Option<Uuid>,
    /// Release directory holding this commit's build on the server
    pub artifact_path: Option<String>,
    /// Migration names applied when this deployment went live, in apply order
    pub migrations: Vec<String>,
    /// Release tree manifest: relative path -> content digest
    pub files: BTreeMap<String, String>,
    pub environment_snapshot: BTreeMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Deployment {
    /// Whether this deployment went live successfully at some point and was not undone
    pub fn is_successful(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Current | DeploymentStatus::Superseded
        )
    }

    pub fn is_current(&self) -> bool {
        self.status == DeploymentStatus::Current
    }

    /// Whether the commit artifact needed to restore this deployment exists
    pub fn has_artifact(&self) -> bool {
        !self.commit_sha.trim().is_empty()
            && self
                .artifact_path
                .as_deref()
                .is_some_and(|path| !path.trim().is_empty())
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback_of.is_some()
    }
}

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Current,
    Superseded,
    RolledBack,
    /// Deploy phase started but the run aborted; never a rollback target
    Failed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Current => "current",
            DeploymentStatus::Superseded => "superseded",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A deployment offered as a rollback destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: Uuid,
    pub server_id: String,
    pub commit_sha: String,
    pub branch: String,
    pub deployed_at: chrono::DateTime<chrono::Utc>,
    pub deployed_by: String,
    pub is_current: bool,
    pub can_rollback: bool,
}

impl From<&Deployment> for RollbackPoint {
    fn from(deployment: &Deployment) -> Self {
        Self {
            id: deployment.id,
            server_id: deployment.server_id.clone(),
            commit_sha: deployment.commit_sha.clone(),
            branch: deployment.branch.clone(),
            deployed_at: deployment.created_at,
            deployed_by: deployment.triggered_by.clone(),
            is_current: deployment.is_current(),
            can_rollback: !deployment.is_current() && deployment.has_artifact(),
        }
    }
}
