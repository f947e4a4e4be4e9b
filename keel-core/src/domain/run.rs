//! Pipeline run domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::stage::{StageDefinition, StageType};

/// One execution of a project's pipeline for a branch/commit
///
/// Created and mutated only by the run coordinator. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub project_id: Uuid,
    pub run_number: i64,
    pub branch: String,
    pub commit_sha: String,
    pub triggered_by: String,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Pipeline run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    RolledBack,
    RollbackFailed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::RollbackFailed => "rollback_failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Stage run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for StageRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageRunStatus::Pending => "pending",
            StageRunStatus::Running => "running",
            StageRunStatus::Success => "success",
            StageRunStatus::Failed => "failed",
            StageRunStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a command (and therefore its stage or rollback step) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Channel lost or unavailable before the command produced output
    ConnectionError,
    /// Stage or step budget exhausted
    Timeout,
    /// Command exited with a non-zero code
    ExecutionError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::ConnectionError => "ConnectionError",
            FailureKind::Timeout => "Timeout",
            FailureKind::ExecutionError => "ExecutionError",
        };
        f.write_str(s)
    }
}

/// Outcome of a single command inside a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub server_id: String,
    pub command: String,
    /// None when the command never completed (timeout or lost channel)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// A stage as executed within one run
///
/// Holds its own copy of the definition's commands, timeout, flags and
/// environment so later edits to the definition never rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStageRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub stage_id: Uuid,
    pub name: String,
    pub stage_type: StageType,
    pub order: i32,
    pub commands: Vec<String>,
    pub timeout_seconds: u64,
    pub continue_on_failure: bool,
    pub env_vars: BTreeMap<String, String>,
    pub status: StageRunStatus,
    /// Server the stage failed on, or the last server it ran on
    pub server_id: Option<String>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub failure: Option<FailureKind>,
    pub error_message: Option<String>,
    pub command_results: Vec<CommandResult>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: Option<i64>,
}

impl PipelineStageRun {
    /// Snapshot a stage definition into a pending stage run
    pub fn snapshot(run_id: Uuid, definition: &StageDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage_id: definition.id,
            name: definition.name.clone(),
            stage_type: definition.stage_type,
            order: definition.order,
            commands: definition.commands.clone(),
            timeout_seconds: definition.timeout_seconds,
            continue_on_failure: definition.continue_on_failure,
            env_vars: definition.env_vars.clone(),
            status: StageRunStatus::Pending,
            server_id: None,
            exit_code: None,
            output: String::new(),
            failure: None,
            error_message: None,
            command_results: Vec::new(),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = StageRunStatus::Running;
        self.started_at = Some(chrono::Utc::now());
    }

    pub fn mark_success(&mut self) {
        self.status = StageRunStatus::Success;
        self.finish();
    }

    pub fn mark_failed(&mut self, failure: FailureKind, message: impl Into<String>) {
        self.status = StageRunStatus::Failed;
        self.failure = Some(failure);
        self.error_message = Some(message.into());
        self.finish();
    }

    pub fn mark_skipped(&mut self) {
        self.status = StageRunStatus::Skipped;
        self.completed_at = Some(chrono::Utc::now());
    }

    /// Appends a line to the captured output
    pub fn append_output(&mut self, line: &str) {
        if !self.output.is_empty() && !self.output.ends_with('\n') {
            self.output.push('\n');
        }
        self.output.push_str(line);
    }

    pub fn is_running(&self) -> bool {
        self.status == StageRunStatus::Running
    }

    pub fn is_success(&self) -> bool {
        self.status == StageRunStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageRunStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == StageRunStatus::Skipped
    }

    /// Human readable duration: `-`, `45s` or `2m 5s`
    pub fn formatted_duration(&self) -> String {
        match self.duration_seconds {
            None => "-".to_string(),
            Some(secs) if secs < 60 => format!("{}s", secs),
            Some(secs) => format!("{}m {}s", secs / 60, secs % 60),
        }
    }

    fn finish(&mut self) {
        let now = chrono::Utc::now();
        self.completed_at = Some(now);
        self.duration_seconds = self
            .started_at
            .map(|started| (now - started).num_seconds().max(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_run() -> PipelineStageRun {
        let now = chrono::Utc::now();
        let definition = StageDefinition {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "install".to_string(),
            stage_type: StageType::PreDeploy,
            order: 1,
            commands: vec!["composer install".to_string()],
            timeout_seconds: 300,
            continue_on_failure: false,
            enabled: true,
            env_vars: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        PipelineStageRun::snapshot(Uuid::new_v4(), &definition)
    }

    #[test]
    fn test_snapshot_copies_definition() {
        let run = stage_run();
        assert_eq!(run.status, StageRunStatus::Pending);
        assert_eq!(run.commands, vec!["composer install".to_string()]);
        assert_eq!(run.timeout_seconds, 300);
    }

    #[test]
    fn test_mark_running_sets_started_at() {
        let mut run = stage_run();
        run.mark_running();
        assert!(run.is_running());
        assert!(run.started_at.is_some());
    }

    #[test]
    fn test_mark_success_computes_duration() {
        let mut run = stage_run();
        run.status = StageRunStatus::Running;
        run.started_at = Some(chrono::Utc::now() - chrono::Duration::minutes(2));
        run.mark_success();

        assert!(run.is_success());
        assert!(run.completed_at.is_some());
        assert!(run.duration_seconds.unwrap() >= 120);
    }

    #[test]
    fn test_mark_failed_records_error() {
        let mut run = stage_run();
        run.started_at = Some(chrono::Utc::now() - chrono::Duration::minutes(1));
        run.mark_failed(FailureKind::ExecutionError, "Command failed with error");

        assert!(run.is_failed());
        assert_eq!(run.failure, Some(FailureKind::ExecutionError));
        assert_eq!(run.error_message.as_deref(), Some("Command failed with error"));
        assert!(run.duration_seconds.unwrap() > 0);
    }

    #[test]
    fn test_mark_skipped() {
        let mut run = stage_run();
        run.mark_skipped();
        assert!(run.is_skipped());
        assert!(run.completed_at.is_some());
        assert!(run.started_at.is_none());
    }

    #[test]
    fn test_append_output() {
        let mut run = stage_run();
        run.append_output("First line");
        run.append_output("Second line");
        assert_eq!(run.output, "First line\nSecond line");
    }

    #[test]
    fn test_formatted_duration() {
        let mut run = stage_run();
        assert_eq!(run.formatted_duration(), "-");
        run.duration_seconds = Some(45);
        assert_eq!(run.formatted_duration(), "45s");
        run.duration_seconds = Some(125);
        assert_eq!(run.formatted_duration(), "2m 5s");
        run.duration_seconds = Some(120);
        assert_eq!(run.formatted_duration(), "2m 0s");
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::RollbackFailed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}
