//! Scripted channel
//!
//! In-process fake used by tests across the workspace. Without rules it
//! understands a tiny subset of shell: `echo <text>`, `exit <code>` and
//! `sleep <seconds>`; anything else succeeds silently. Sleeps go through the
//! tokio clock, so tests with paused time complete instantly.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::domain::log::LogStream;

use super::{ChannelError, CommandOutput, RemoteExecutionChannel, Session};
use crate::sink::OutputSink;

/// Scripted response to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Prints the given output and exits with `code`
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Runs for the given duration, then exits 0
    Sleep(Duration),
    /// The connection drops while the command runs
    Disconnect,
}

impl Reply {
    pub fn exit(code: i32) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Exit 0 printing `stdout`
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Exit `code` printing `stderr`
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn interpret(command: &str) -> Self {
        let command = command.trim();
        if let Some(text) = command.strip_prefix("echo ") {
            let text = text.trim().trim_matches(|c| c == '"' || c == '\'');
            return Reply::stdout(format!("{}\n", text));
        }
        if let Some(code) = command.strip_prefix("exit ")
            && let Ok(code) = code.trim().parse::<i32>()
        {
            return Reply::exit(code);
        }
        if let Some(secs) = command.strip_prefix("sleep ")
            && let Ok(secs) = secs.trim().parse::<f64>()
        {
            return Reply::Sleep(Duration::from_secs_f64(secs.max(0.0)));
        }
        Reply::exit(0)
    }
}

/// A command as seen by the fake
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCommand {
    pub server_id: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub timeout_remaining: Duration,
}

struct Rule {
    server_id: Option<String>,
    needle: String,
    reply: Reply,
}

#[derive(Default)]
struct State {
    unreachable: HashSet<String>,
    rules: Vec<Rule>,
    executed: Vec<ExecutedCommand>,
    connects: usize,
    open_sessions: usize,
}

/// Programmable in-memory channel
///
/// Clones share state, so a test can keep a handle for assertions after
/// handing the channel to the engine.
#[derive(Clone, Default)]
pub struct ScriptedChannel {
    state: Arc<Mutex<State>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect to `server_id` fails
    pub fn unreachable(self, server_id: impl Into<String>) -> Self {
        self.set_unreachable(server_id, true);
        self
    }

    pub fn set_unreachable(&self, server_id: impl Into<String>, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        let server_id = server_id.into();
        if unreachable {
            state.unreachable.insert(server_id);
        } else {
            state.unreachable.remove(&server_id);
        }
    }

    /// Commands containing `needle` get `reply`, on any server
    ///
    /// Later rules take precedence over earlier ones.
    pub fn on(self, needle: impl Into<String>, reply: Reply) -> Self {
        self.add_rule(None, needle.into(), reply);
        self
    }

    /// Like [`ScriptedChannel::on`], restricted to one server
    pub fn on_server(self, server_id: impl Into<String>, needle: impl Into<String>, reply: Reply) -> Self {
        self.add_rule(Some(server_id.into()), needle.into(), reply);
        self
    }

    fn add_rule(&self, server_id: Option<String>, needle: String, reply: Reply) {
        self.state.lock().unwrap().rules.push(Rule {
            server_id,
            needle,
            reply,
        });
    }

    /// All commands executed so far, in order
    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.state.lock().unwrap().executed.clone()
    }

    /// Commands executed on one server, in order
    pub fn commands_for(&self, server_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|c| c.server_id == server_id)
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Sessions connected and not yet disconnected or dropped
    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().open_sessions
    }

    fn reply_for(&self, server_id: &str, command: &str) -> Reply {
        let state = self.state.lock().unwrap();
        state
            .rules
            .iter()
            .rev()
            .find(|rule| {
                rule.server_id.as_deref().is_none_or(|s| s == server_id)
                    && command.contains(&rule.needle)
            })
            .map(|rule| rule.reply.clone())
            .unwrap_or_else(|| Reply::interpret(command))
    }
}

#[async_trait]
impl RemoteExecutionChannel for ScriptedChannel {
    async fn connect(&self, server_id: &str) -> Result<Box<dyn Session>, ChannelError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.unreachable.contains(server_id) {
            return Err(ChannelError::ConnectFailed {
                server: server_id.to_string(),
                message: "host unreachable".to_string(),
            });
        }
        state.open_sessions += 1;
        Ok(Box::new(ScriptedSession {
            server_id: server_id.to_string(),
            channel: self.clone(),
            open: true,
        }))
    }
}

struct ScriptedSession {
    server_id: String,
    channel: ScriptedChannel,
    open: bool,
}

impl ScriptedSession {
    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.channel.state.lock().unwrap().open_sessions -= 1;
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn execute(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout_remaining: Duration,
        sink: &dyn OutputSink,
    ) -> Result<CommandOutput, ChannelError> {
        if !self.open {
            return Err(ChannelError::Disconnected {
                server: self.server_id.clone(),
                message: "session already closed".to_string(),
            });
        }

        self.channel
            .state
            .lock()
            .unwrap()
            .executed
            .push(ExecutedCommand {
                server_id: self.server_id.clone(),
                command: command.to_string(),
                env: env.clone(),
                timeout_remaining,
            });

        match self.channel.reply_for(&self.server_id, command) {
            Reply::Exit {
                code,
                stdout,
                stderr,
            } => {
                for line in stdout.lines() {
                    sink.line(LogStream::Stdout, line);
                }
                for line in stderr.lines() {
                    sink.line(LogStream::Stderr, line);
                }
                Ok(CommandOutput {
                    exit_code: code,
                    stdout,
                    stderr,
                })
            }
            Reply::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(CommandOutput::default())
            }
            Reply::Disconnect => {
                self.close();
                Err(ChannelError::Disconnected {
                    server: self.server_id.clone(),
                    message: "connection reset by peer".to_string(),
                })
            }
        }
    }

    async fn disconnect(&mut self) {
        self.close();
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.close();
    }
}
