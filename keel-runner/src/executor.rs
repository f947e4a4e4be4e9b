//! Stage executor
//!
//! Runs the commands of one stage against one server:
//! - waits for the server to be free, then connects
//! - runs commands in order, stopping at the first failure
//! - enforces one time budget for the whole stage
//! - always disconnects, including after a timeout
//!
//! Failures are classified as `ConnectionError`, `Timeout` or
//! `ExecutionError` and returned as data, never as `Err`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use keel_core::domain::log::LogLevel;
use keel_core::domain::run::{CommandResult, FailureKind, PipelineStageRun};

use crate::channel::{ChannelError, RemoteExecutionChannel, Session};
use crate::locks::ServerLocks;
use crate::sink::{CaptureSink, OutputSink};

/// Longest budget a stage can get, whatever its configured timeout
pub const MAX_STAGE_BUDGET: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What the executor needs to know about a stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageSnapshot {
    pub name: String,
    pub commands: Vec<String>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
}

impl From<&PipelineStageRun> for StageSnapshot {
    fn from(stage: &PipelineStageRun) -> Self {
        Self {
            name: stage.name.clone(),
            commands: stage.commands.clone(),
            timeout: Duration::from_secs(stage.timeout_seconds),
            env: stage.env_vars.clone(),
        }
    }
}

/// Why a stage (or rollback step) stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of a stage on one server
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub server_id: String,
    /// One entry per command that started, in order
    pub commands: Vec<CommandResult>,
    pub failure: Option<StageFailure>,
    pub duration: Duration,
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Exit code of the last command that completed
    pub fn exit_code(&self) -> Option<i32> {
        self.commands.iter().rev().find_map(|c| c.exit_code)
    }

    /// Captured stdout and stderr of every command, in order
    pub fn output(&self) -> String {
        let mut output = String::new();
        for command in &self.commands {
            output.push_str(&command.stdout);
            output.push_str(&command.stderr);
        }
        output
    }
}

/// Outcome of a single command on an open session
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAttempt {
    pub result: CommandResult,
    pub failure: Option<StageFailure>,
}

/// Runs one command with a hard deadline
///
/// On timeout the command future is dropped, which kills local work; the
/// caller must still disconnect the session to stop remote work.
///
/// # Arguments
/// * `session` - Open session to run on
/// * `command` - Shell command
/// * `env` - Exported environment
/// * `deadline` - Instant the budget runs out
/// * `budget` - Total budget, for messages
/// * `sink` - Receives streamed output
pub async fn run_command(
    session: &mut dyn Session,
    command: &str,
    env: &BTreeMap<String, String>,
    deadline: Instant,
    budget: Duration,
    sink: &dyn OutputSink,
) -> CommandAttempt {
    let server_id = session.server_id().to_string();
    let started = Instant::now();
    let capture = CaptureSink::new(sink);
    let remaining = deadline.saturating_duration_since(started);

    let outcome = if remaining.is_zero() {
        None
    } else {
        tokio::time::timeout_at(deadline, session.execute(command, env, remaining, &capture))
            .await
            .ok()
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Some(Ok(output)) => {
            let failure = (!output.success()).then(|| {
                StageFailure::new(
                    FailureKind::ExecutionError,
                    format!("Command '{}' exited with code {}", command, output.exit_code),
                )
            });
            CommandAttempt {
                result: CommandResult {
                    server_id,
                    command: command.to_string(),
                    exit_code: Some(output.exit_code),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration_ms,
                },
                failure,
            }
        }
        Some(Err(e)) => {
            let (stdout, stderr) = capture.take();
            CommandAttempt {
                result: CommandResult {
                    server_id,
                    command: command.to_string(),
                    exit_code: None,
                    stdout,
                    stderr,
                    duration_ms,
                },
                failure: Some(StageFailure::new(FailureKind::ConnectionError, e.to_string())),
            }
        }
        None => {
            let (stdout, stderr) = capture.take();
            CommandAttempt {
                result: CommandResult {
                    server_id,
                    command: command.to_string(),
                    exit_code: None,
                    stdout,
                    stderr,
                    duration_ms,
                },
                failure: Some(StageFailure::new(
                    FailureKind::Timeout,
                    format!(
                        "Timed out after {}s while running '{}'",
                        budget.as_secs(),
                        command
                    ),
                )),
            }
        }
    }
}

/// Connects within a deadline, classifying failures
pub async fn connect_with_deadline(
    channel: &dyn RemoteExecutionChannel,
    server_id: &str,
    deadline: Instant,
    budget: Duration,
) -> Result<Box<dyn Session>, StageFailure> {
    match tokio::time::timeout_at(deadline, channel.connect(server_id)).await {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(e)) => Err(connection_failure(server_id, e)),
        Err(_) => Err(StageFailure::new(
            FailureKind::Timeout,
            format!(
                "Timed out after {}s while connecting to {}",
                budget.as_secs(),
                server_id
            ),
        )),
    }
}

fn connection_failure(server_id: &str, error: ChannelError) -> StageFailure {
    match error {
        ChannelError::UnknownServer(_) | ChannelError::ConnectFailed { .. } => {
            StageFailure::new(FailureKind::ConnectionError, error.to_string())
        }
        other => StageFailure::new(
            FailureKind::ConnectionError,
            format!("Failed to connect to {}: {}", server_id, other),
        ),
    }
}

/// Executes stages against servers
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs every command of `stage` on `server_id`
    ///
    /// # Returns
    /// The stage result; failures are part of the result
    async fn execute_stage(
        &self,
        stage: &StageSnapshot,
        server_id: &str,
        channel: &dyn RemoteExecutionChannel,
        sink: &dyn OutputSink,
    ) -> StageResult;
}

/// Standard implementation of StageExecutor
pub struct StandardStageExecutor {
    locks: Arc<ServerLocks>,
}

impl StandardStageExecutor {
    /// # Arguments
    /// * `locks` - Server locks shared with everything else that runs commands
    pub fn new(locks: Arc<ServerLocks>) -> Self {
        Self { locks }
    }

    pub fn locks(&self) -> &Arc<ServerLocks> {
        &self.locks
    }
}

#[async_trait]
impl StageExecutor for StandardStageExecutor {
    async fn execute_stage(
        &self,
        stage: &StageSnapshot,
        server_id: &str,
        channel: &dyn RemoteExecutionChannel,
        sink: &dyn OutputSink,
    ) -> StageResult {
        let _server = self.locks.acquire(server_id).await;

        let started = Instant::now();
        let budget = stage.timeout.min(MAX_STAGE_BUDGET);
        let deadline = started + budget;
        info!(
            "Executing stage '{}' on {} ({} commands, {}s budget)",
            stage.name,
            server_id,
            stage.commands.len(),
            budget.as_secs()
        );
        sink.system(
            LogLevel::Info,
            &format!("Running stage '{}' on {}", stage.name, server_id),
        );

        let mut session =
            match connect_with_deadline(channel, server_id, deadline, budget).await {
                Ok(session) => session,
                Err(failure) => {
                    warn!("Stage '{}' on {}: {}", stage.name, server_id, failure.message);
                    sink.system(LogLevel::Error, &failure.message);
                    return StageResult {
                        server_id: server_id.to_string(),
                        commands: Vec::new(),
                        failure: Some(failure),
                        duration: started.elapsed(),
                    };
                }
            };

        let mut commands = Vec::with_capacity(stage.commands.len());
        let mut failure = None;
        for command in &stage.commands {
            debug!("[{}] $ {}", server_id, command);
            sink.system(LogLevel::Debug, &format!("$ {}", command));

            let attempt = run_command(
                session.as_mut(),
                command,
                &stage.env,
                deadline,
                budget,
                sink,
            )
            .await;
            commands.push(attempt.result);
            if let Some(f) = attempt.failure {
                failure = Some(f);
                break;
            }
        }

        session.disconnect().await;

        match &failure {
            Some(f) => {
                warn!(
                    "Stage '{}' failed on {} ({}): {}",
                    stage.name, server_id, f.kind, f.message
                );
                sink.system(LogLevel::Error, &f.message);
            }
            None => {
                info!("Stage '{}' succeeded on {}", stage.name, server_id);
            }
        }

        StageResult {
            server_id: server_id.to_string(),
            commands,
            failure,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LocalChannel, Reply, ScriptedChannel};
    use crate::sink::{InMemoryLogBuffer, NullSink};

    fn stage(commands: &[&str], timeout_secs: u64) -> StageSnapshot {
        StageSnapshot {
            name: "build".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            timeout: Duration::from_secs(timeout_secs),
            env: BTreeMap::new(),
        }
    }

    fn executor() -> StandardStageExecutor {
        StandardStageExecutor::new(Arc::new(ServerLocks::new()))
    }

    /// Paused-clock timers fire on millisecond ticks
    fn assert_about(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(
            diff < Duration::from_millis(50),
            "expected about {:?}, got {:?}",
            expected,
            actual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_commands_succeed() {
        let channel = ScriptedChannel::new();
        let result = executor()
            .execute_stage(&stage(&["echo one", "echo two"], 60), "web-1", &channel, &NullSink)
            .await;

        assert!(result.is_success());
        assert_eq!(result.commands.len(), 2);
        assert_eq!(result.exit_code(), Some(0));
        assert_eq!(result.output(), "one\ntwo\n");
        assert_eq!(channel.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_first_failing_command() {
        let channel = ScriptedChannel::new();
        let buffer = InMemoryLogBuffer::new();
        let result = executor()
            .execute_stage(
                &stage(&["echo hi", "exit 2", "echo unreachable"], 60),
                "web-1",
                &channel,
                &buffer,
            )
            .await;

        let failure = result.failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::ExecutionError);
        assert_eq!(result.exit_code(), Some(2));
        assert!(result.output().contains("hi"));
        assert_eq!(channel.commands_for("web-1"), vec!["echo hi", "exit 2"]);
        assert!(
            buffer
                .drain()
                .iter()
                .all(|entry| !entry.message.contains("unreachable"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_disconnects_session() {
        let channel = ScriptedChannel::new();
        let started = Instant::now();
        let result = executor()
            .execute_stage(&stage(&["sleep 10"], 5), "web-1", &channel, &NullSink)
            .await;

        let failure = result.failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(result.commands[0].exit_code, None);
        assert_about(started.elapsed(), Duration::from_secs(5));
        assert_eq!(channel.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_covers_whole_stage() {
        let channel = ScriptedChannel::new();
        let result = executor()
            .execute_stage(
                &stage(&["sleep 3", "sleep 3", "echo never"], 5),
                "web-1",
                &channel,
                &NullSink,
            )
            .await;

        assert_eq!(result.failure.unwrap().kind, FailureKind::Timeout);
        let executed = channel.executed();
        assert_eq!(executed.len(), 2);
        assert_about(executed[0].timeout_remaining, Duration::from_secs(5));
        assert_about(executed[1].timeout_remaining, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_timeout_is_capped() {
        let channel = ScriptedChannel::new();
        let mut snapshot = stage(&["echo hi"], 60);
        snapshot.timeout = Duration::MAX;

        let result = executor()
            .execute_stage(&snapshot, "web-1", &channel, &NullSink)
            .await;
        assert!(result.is_success());
        assert_eq!(result.output(), "hi\n");
        assert_about(channel.executed()[0].timeout_remaining, MAX_STAGE_BUDGET);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_is_connection_error() {
        let channel = ScriptedChannel::new().unreachable("web-2");
        let result = executor()
            .execute_stage(&stage(&["echo hi"], 60), "web-2", &channel, &NullSink)
            .await;

        assert_eq!(result.failure.unwrap().kind, FailureKind::ConnectionError);
        assert!(result.commands.is_empty());
        assert!(channel.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_channel_is_connection_error() {
        let channel = ScriptedChannel::new().on("migrate", Reply::Disconnect);
        let result = executor()
            .execute_stage(&stage(&["php artisan migrate", "echo done"], 60), "web-1", &channel, &NullSink)
            .await;

        assert_eq!(result.failure.unwrap().kind, FailureKind::ConnectionError);
        assert_eq!(result.commands.len(), 1);
        assert_eq!(channel.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_environment_reaches_commands() {
        let channel = ScriptedChannel::new();
        let mut snapshot = stage(&["env"], 60);
        snapshot
            .env
            .insert("APP_ENV".to_string(), "production".to_string());

        executor()
            .execute_stage(&snapshot, "web-1", &channel, &NullSink)
            .await;
        assert_eq!(channel.executed()[0].env["APP_ENV"], "production");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_server_stages_are_serialized() {
        let executor = executor();
        let channel = ScriptedChannel::new();
        let started = Instant::now();

        let build = stage(&["sleep 2"], 60);
        let (a, b) = tokio::join!(
            executor.execute_stage(&build, "web-1", &channel, &NullSink),
            executor.execute_stage(&build, "web-1", &channel, &NullSink),
        );
        assert!(a.is_success() && b.is_success());
        assert_about(started.elapsed(), Duration::from_secs(4));

        let started = Instant::now();
        let (a, b) = tokio::join!(
            executor.execute_stage(&build, "web-1", &channel, &NullSink),
            executor.execute_stage(&build, "web-2", &channel, &NullSink),
        );
        assert!(a.is_success() && b.is_success());
        assert_about(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_local_timeout_kills_process() {
        let channel = LocalChannel::new();
        let started = std::time::Instant::now();
        let result = executor()
            .execute_stage(&stage(&["sleep 5"], 1), "localhost", &channel, &NullSink)
            .await;

        assert_eq!(result.failure.unwrap().kind, FailureKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
