//! Local shell channel
//!
//! Runs commands with `sh -c` on the engine host. Useful for single-host
//! setups where the engine lives next to the application.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{ChannelError, CommandOutput, RemoteExecutionChannel, Session, run_streaming};
use crate::sink::OutputSink;

/// Channel executing on the local machine
#[derive(Debug, Clone, Default)]
pub struct LocalChannel {
    /// Server ids this channel answers for; empty accepts any id
    servers: HashSet<String>,
    working_dir: Option<PathBuf>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the channel to the given server ids
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl RemoteExecutionChannel for LocalChannel {
    async fn connect(&self, server_id: &str) -> Result<Box<dyn Session>, ChannelError> {
        if !self.servers.is_empty() && !self.servers.contains(server_id) {
            return Err(ChannelError::UnknownServer(server_id.to_string()));
        }
        if let Some(dir) = &self.working_dir
            && !dir.is_dir()
        {
            return Err(ChannelError::ConnectFailed {
                server: server_id.to_string(),
                message: format!("working directory {} does not exist", dir.display()),
            });
        }
        Ok(Box::new(LocalSession {
            server_id: server_id.to_string(),
            working_dir: self.working_dir.clone(),
        }))
    }
}

struct LocalSession {
    server_id: String,
    working_dir: Option<PathBuf>,
}

#[async_trait]
impl Session for LocalSession {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn execute(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        _timeout_remaining: Duration,
        sink: &dyn OutputSink,
    ) -> Result<CommandOutput, ChannelError> {
        debug!("[{}] sh -c {}", self.server_id, command);
        let mut process = Command::new("sh");
        process.arg("-c").arg(command).envs(env);
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        Ok(run_streaming(process, sink).await?)
    }

    // Children are killed when their execute future is dropped.
    async fn disconnect(&mut self) {}
}
