//! Rollback domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::run::FailureKind;

/// Which parts of a deployment a rollback restores, and where
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOptions {
    #[serde(default)]
    pub include_database: bool,
    #[serde(default)]
    pub include_files: bool,
    /// Servers to roll back; empty means the source deployment's server
    #[serde(default)]
    pub server_ids: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStepKind {
    StopServices,
    ReverseMigration,
    RestoreFiles,
    RestoreEnvironment,
    RestartServices,
    HealthCheck,
}

impl std::fmt::Display for RollbackStepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RollbackStepKind::StopServices => "stop_services",
            RollbackStepKind::ReverseMigration => "reverse_migration",
            RollbackStepKind::RestoreFiles => "restore_files",
            RollbackStepKind::RestoreEnvironment => "restore_environment",
            RollbackStepKind::RestartServices => "restart_services",
            RollbackStepKind::HealthCheck => "health_check",
        };
        f.write_str(s)
    }
}

/// One command of a rollback, run on every target server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub kind: RollbackStepKind,
    pub description: String,
    pub command: String,
    pub timeout_seconds: u64,
    pub estimated_seconds: u64,
}

/// Ordered rollback of one deployment to an older one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_deployment_id: Uuid,
    pub target_deployment_id: Uuid,
    pub source_commit: String,
    pub target_commit: String,
    pub options: RollbackOptions,
    pub server_ids: Vec<String>,
    pub steps: Vec<RollbackStep>,
    /// Environment exported to every step (the target's snapshot)
    pub env_vars: BTreeMap<String, String>,
    pub affected_files: Vec<String>,
    /// Migrations undone, in the order they are reverted
    pub migrations_reverted: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Non-mutating description of what a rollback would do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPreview {
    pub plan_id: Uuid,
    pub source_deployment_id: Uuid,
    pub target_deployment_id: Uuid,
    pub server_ids: Vec<String>,
    pub steps: Vec<RollbackStep>,
    pub affected_files: Vec<String>,
    pub migrations_reverted: Vec<String>,
    /// Per server; servers are rolled back one after another
    pub estimated_downtime_seconds: u64,
}

/// Persisted outcome of executing a rollback plan
///
/// Append-only. Deployments are referenced by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub plan_id: Uuid,
    /// Run whose failure triggered this rollback, if automatic
    pub run_id: Option<Uuid>,
    pub source_deployment_id: Uuid,
    pub target_deployment_id: Uuid,
    pub include_database: bool,
    pub include_files: bool,
    pub server_ids: Vec<String>,
    pub dry_run: bool,
    pub status: RollbackStatus,
    pub server_outcomes: Vec<ServerRollbackOutcome>,
    pub error_message: Option<String>,
    pub triggered_by: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl RollbackRecord {
    pub fn duration_seconds(&self) -> i64 {
        (self.completed_at - self.started_at).num_seconds().max(0)
    }

    /// Servers an operator has to re-target
    pub fn failed_servers(&self) -> Vec<&ServerRollbackOutcome> {
        self.server_outcomes
            .iter()
            .filter(|o| o.status == ServerRollbackStatus::Failed)
            .collect()
    }

    pub fn outcome_for(&self, server_id: &str) -> Option<&ServerRollbackOutcome> {
        self.server_outcomes.iter().find(|o| o.server_id == server_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    RolledBack,
    RollbackFailed,
    Cancelled,
}

impl RollbackStatus {
    /// Overall status from per-server outcomes
    pub fn from_outcomes(outcomes: &[ServerRollbackOutcome]) -> Self {
        if outcomes
            .iter()
            .any(|o| o.status == ServerRollbackStatus::Failed)
        {
            RollbackStatus::RollbackFailed
        } else if outcomes
            .iter()
            .any(|o| o.status == ServerRollbackStatus::Cancelled)
        {
            RollbackStatus::Cancelled
        } else {
            RollbackStatus::RolledBack
        }
    }
}

impl std::fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RollbackStatus::RolledBack => "rolled_back",
            RollbackStatus::RollbackFailed => "rollback_failed",
            RollbackStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRollbackStatus {
    Success,
    Failed,
    Cancelled,
}

/// Result of rolling back a single server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRollbackOutcome {
    pub server_id: String,
    pub status: ServerRollbackStatus,
    pub failure: Option<FailureKind>,
    pub failed_step: Option<RollbackStepKind>,
    pub steps_completed: usize,
    pub error_message: Option<String>,
    /// Full captured output of every step that ran
    pub output: String,
    /// Deployment row created for this server on success
    pub deployment_id: Option<Uuid>,
}

impl ServerRollbackOutcome {
    /// `success`, `cancelled`, or the failure kind
    pub fn summary(&self) -> String {
        match (self.status, self.failure) {
            (ServerRollbackStatus::Success, _) => "success".to_string(),
            (ServerRollbackStatus::Cancelled, _) => "cancelled".to_string(),
            (ServerRollbackStatus::Failed, Some(kind)) => kind.to_string(),
            (ServerRollbackStatus::Failed, None) => "failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(server: &str, status: ServerRollbackStatus) -> ServerRollbackOutcome {
        ServerRollbackOutcome {
            server_id: server.to_string(),
            status,
            failure: None,
            failed_step: None,
            steps_completed: 0,
            error_message: None,
            output: String::new(),
            deployment_id: None,
        }
    }

    #[test]
    fn test_status_from_outcomes() {
        let all_ok = vec![
            outcome("a", ServerRollbackStatus::Success),
            outcome("b", ServerRollbackStatus::Success),
        ];
        assert_eq!(RollbackStatus::from_outcomes(&all_ok), RollbackStatus::RolledBack);

        let one_failed = vec![
            outcome("a", ServerRollbackStatus::Success),
            outcome("b", ServerRollbackStatus::Failed),
            outcome("c", ServerRollbackStatus::Cancelled),
        ];
        assert_eq!(
            RollbackStatus::from_outcomes(&one_failed),
            RollbackStatus::RollbackFailed
        );

        let cancelled = vec![
            outcome("a", ServerRollbackStatus::Success),
            outcome("b", ServerRollbackStatus::Cancelled),
        ];
        assert_eq!(RollbackStatus::from_outcomes(&cancelled), RollbackStatus::Cancelled);
    }

    #[test]
    fn test_outcome_summary() {
        let mut failed = outcome("b", ServerRollbackStatus::Failed);
        failed.failure = Some(FailureKind::ConnectionError);
        assert_eq!(failed.summary(), "ConnectionError");
        assert_eq!(outcome("a", ServerRollbackStatus::Success).summary(), "success");
    }
}
