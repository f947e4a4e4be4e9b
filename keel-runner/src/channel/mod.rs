//! Remote execution channels
//!
//! A channel opens sessions to servers; a session runs shell commands with an
//! environment, streaming output to a sink. Implementations:
//! - `ssh`: the system `ssh` client with a multiplexed control connection
//! - `local`: `sh -c` on the engine host
//! - `scripted`: programmable fake for tests

mod local;
mod process;
mod scripted;
mod ssh;

pub use local::LocalChannel;
pub use process::run_streaming;
pub use scripted::{ExecutedCommand, Reply, ScriptedChannel};
pub use ssh::{SshChannel, SshOptions, SshTarget};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::sink::OutputSink;

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Failed to connect to {server}: {message}")]
    ConnectFailed { server: String, message: String },

    #[error("Connection to {server} lost: {message}")]
    Disconnected { server: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens sessions to servers by id
#[async_trait]
pub trait RemoteExecutionChannel: Send + Sync {
    /// Connects to a server
    ///
    /// # Errors
    /// Any error here means the server was never reached.
    async fn connect(&self, server_id: &str) -> Result<Box<dyn Session>, ChannelError>;
}

/// An open connection to one server
///
/// Commands run one at a time. Callers must call `disconnect` when done,
/// including after a timeout; dropping a session without it is best effort.
#[async_trait]
pub trait Session: Send {
    fn server_id(&self) -> &str;

    /// Runs one shell command to completion
    ///
    /// # Arguments
    /// * `command` - Shell command line
    /// * `env` - Variables exported before the command runs
    /// * `timeout_remaining` - Budget left for the caller; the caller enforces it
    /// * `sink` - Receives output lines as they are produced
    ///
    /// # Returns
    /// The exit code and full output. A non-zero exit code is not an error.
    async fn execute(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout_remaining: Duration,
        sink: &dyn OutputSink,
    ) -> Result<CommandOutput, ChannelError>;

    /// Closes the connection and kills anything still running on it
    async fn disconnect(&mut self);
}

/// Quotes a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Prefixes a command with `export` statements for the given environment
pub fn with_exports(command: &str, env: &BTreeMap<String, String>) -> String {
    if env.is_empty() {
        return command.to_string();
    }
    let exports: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("export {}={}", key, shell_quote(value)))
        .collect();
    format!("{}; {}", exports.join("; "), command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$HOME && rm"), "'$HOME && rm'");
    }

    #[test]
    fn test_with_exports() {
        let mut env = BTreeMap::new();
        assert_eq!(with_exports("make", &env), "make");

        env.insert("APP_ENV".to_string(), "production".to_string());
        env.insert("DB_PASS".to_string(), "p@ss'word".to_string());
        assert_eq!(
            with_exports("make", &env),
            "export APP_ENV='production'; export DB_PASS='p@ss'\\''word'; make"
        );
    }
}
