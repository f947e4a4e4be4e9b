//! SSH channel
//!
//! Uses the system `ssh` client. `connect` opens a control master for the
//! server; every command reuses it, and `disconnect` tears it down, which
//! also hangs up any remote command still attached to it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{
    ChannelError, CommandOutput, RemoteExecutionChannel, Session, run_streaming, with_exports,
};
use crate::sink::{NullSink, OutputSink};

/// Exit status ssh uses for its own errors
const SSH_ERROR_EXIT: i32 = 255;

/// How to reach one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Client-wide ssh settings
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// ssh executable
    pub binary: String,
    pub connect_timeout: Duration,
    /// Directory holding control sockets
    pub control_dir: PathBuf,
    /// How long an idle control master survives a missed disconnect
    pub control_persist: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            control_dir: std::env::temp_dir(),
            control_persist: Duration::from_secs(600),
        }
    }
}

/// Channel backed by the system ssh client
pub struct SshChannel {
    targets: HashMap<String, SshTarget>,
    options: SshOptions,
}

impl SshChannel {
    /// # Arguments
    /// * `targets` - Server id -> connection details
    /// * `options` - Client-wide settings
    pub fn new(targets: HashMap<String, SshTarget>, options: SshOptions) -> Self {
        Self { targets, options }
    }
}

#[async_trait]
impl RemoteExecutionChannel for SshChannel {
    async fn connect(&self, server_id: &str) -> Result<Box<dyn Session>, ChannelError> {
        let target = self
            .targets
            .get(server_id)
            .ok_or_else(|| ChannelError::UnknownServer(server_id.to_string()))?;

        let mut session = SshSession {
            server_id: server_id.to_string(),
            target: target.clone(),
            options: self.options.clone(),
            control_path: self
                .options
                .control_dir
                .join(format!("keel-{}-{}", server_id, uuid::Uuid::new_v4().simple())),
            open: false,
        };

        info!("Opening ssh connection to {} ({})", server_id, target.host);
        let mut check = session.command();
        check
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!(
                "ControlPersist={}",
                self.options.control_persist.as_secs().max(1)
            ))
            .arg(target.destination())
            .arg("true");

        let output = run_streaming(check, &NullSink).await?;
        if !output.success() {
            let message = format!(
                "exit_code={}, stderr='{}'",
                output.exit_code,
                output.stderr.trim()
            );
            error!("ssh connect to {} failed: {}", server_id, message);
            return Err(ChannelError::ConnectFailed {
                server: server_id.to_string(),
                message,
            });
        }

        session.open = true;
        Ok(Box::new(session))
    }
}

struct SshSession {
    server_id: String,
    target: SshTarget,
    options: SshOptions,
    control_path: PathBuf,
    open: bool,
}

impl SshSession {
    /// Base ssh invocation sharing this session's control socket
    fn command(&self) -> Command {
        let mut command = Command::new(&self.options.binary);
        command
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        if let Some(identity) = &self.target.identity_file {
            command.arg("-i").arg(identity);
        }
        command
    }

    fn exit_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-O".to_string(),
            "exit".to_string(),
            self.target.destination(),
        ]
    }
}

#[async_trait]
impl Session for SshSession {
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
        if !self.open {
            return Err(ChannelError::Disconnected {
                server: self.server_id.clone(),
                message: "session already closed".to_string(),
            });
        }

        debug!("[{}] ssh {}", self.server_id, command);
        let mut ssh = self.command();
        ssh.arg(self.target.destination())
            .arg("--")
            .arg(with_exports(command, env));

        let output = run_streaming(ssh, sink).await?;

        // 255 is also a legal remote exit code; only treat it as a lost
        // channel when the remote side printed nothing.
        if output.exit_code == SSH_ERROR_EXIT && output.stdout.is_empty() {
            warn!(
                "[{}] ssh channel error: {}",
                self.server_id,
                output.stderr.trim()
            );
            return Err(ChannelError::Disconnected {
                server: self.server_id.clone(),
                message: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }

    async fn disconnect(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        debug!("Closing ssh control connection to {}", self.server_id);
        let result = Command::new(&self.options.binary)
            .args(self.exit_args())
            .kill_on_drop(true)
            .output()
            .await;
        if let Err(e) = result {
            warn!(
                "Failed to close ssh connection to {}: {}",
                self.server_id, e
            );
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.open {
            warn!(
                "ssh session to {} dropped without disconnect, closing",
                self.server_id
            );
            let _ = std::process::Command::new(&self.options.binary)
                .args(self.exit_args())
                .output();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.5".to_string(),
            port: 2222,
            user: "deploy".to_string(),
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
        }
    }

    #[test]
    fn test_target_defaults_port() {
        let target: SshTarget =
            serde_json::from_str(r#"{"host": "web-1.internal", "user": "deploy"}"#).unwrap();
        assert_eq!(target.port, 22);
        assert_eq!(target.destination(), "deploy@web-1.internal");
    }

    #[tokio::test]
    async fn test_unknown_server_is_rejected() {
        let channel = SshChannel::new(HashMap::new(), SshOptions::default());
        assert!(matches!(
            channel.connect("web-1").await,
            Err(ChannelError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_master_start_is_connect_error() {
        // `false` stands in for an ssh client that cannot reach the host
        let options = SshOptions {
            binary: "false".to_string(),
            ..SshOptions::default()
        };
        let mut targets = HashMap::new();
        targets.insert("web-1".to_string(), target());

        let channel = SshChannel::new(targets, options);
        assert!(matches!(
            channel.connect("web-1").await,
            Err(ChannelError::ConnectFailed { .. })
        ));
    }
}
