//! Keel Runner
//!
//! Remote execution side of the Keel deployment engine.
//!
//! Architecture:
//! - Channels: connect to a server and run shell commands (SSH, local shell, scripted fake)
//! - Executor: runs one stage's commands against one server within a time budget
//! - Sinks: observe command output line by line while it is produced
//! - Locks: serialize all command execution against a given server
//!
//! The orchestrator drives these pieces; nothing in this crate persists state.

pub mod channel;
pub mod executor;
pub mod locks;
pub mod sink;
pub mod vars;

pub use channel::{ChannelError, CommandOutput, RemoteExecutionChannel, Session};
pub use executor::{StageExecutor, StageFailure, StageResult, StageSnapshot, StandardStageExecutor};
pub use locks::ServerLocks;
pub use sink::{InMemoryLogBuffer, NullSink, OutputSink};
