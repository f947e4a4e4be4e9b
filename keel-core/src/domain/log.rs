//! Log domain types

use serde::{Deserialize, Serialize};

/// A log line captured while a stage runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub stream: LogStream,
    pub message: String,
}

impl LogEntry {
    /// Line emitted by a remote command
    pub fn output(stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            level: match stream {
                LogStream::Stderr => LogLevel::Warning,
                _ => LogLevel::Info,
            },
            stream,
            message: message.into(),
        }
    }

    /// Line written by the engine itself
    pub fn system(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            level,
            stream: LogStream::System,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}
