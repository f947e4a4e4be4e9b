//! Engine context
//!
//! Everything the coordinator, rollback planner/executor and services share:
//! persistence, project settings, the remote execution channel, per-server
//! locks and the notification hub.

use std::sync::Arc;
use std::time::Duration;

use keel_core::domain::project::ProjectSettings;
use keel_runner::{RemoteExecutionChannel, ServerLocks, StageExecutor, StandardStageExecutor};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::inventory::ProjectDirectory;
use crate::notify::Notifier;
use crate::repository::Store;

/// Tunables of a running engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How often buffered stage output is persisted
    pub log_flush_interval: Duration,
    /// How often a running pipeline refreshes its project lock
    pub lock_heartbeat_interval: Duration,
    /// Budget of the migration/manifest inspections run after the deploy phase
    pub inspect_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_flush_interval: Duration::from_secs(2),
            lock_heartbeat_interval: Duration::from_secs(15),
            inspect_timeout: Duration::from_secs(60),
        }
    }
}

/// Shared engine state
///
/// Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub channel: Arc<dyn RemoteExecutionChannel>,
    /// Serialize every command sent to a server, pipelines and rollbacks alike
    pub locks: Arc<ServerLocks>,
    pub executor: Arc<dyn StageExecutor>,
    pub notifier: Notifier,
    pub settings: EngineSettings,
}

impl Engine {
    /// # Arguments
    /// * `store` - Persistence
    /// * `projects` - Project settings source
    /// * `channel` - Remote execution channel
    pub fn new(
        store: Arc<dyn Store>,
        projects: Arc<dyn ProjectDirectory>,
        channel: Arc<dyn RemoteExecutionChannel>,
    ) -> Self {
        let locks = Arc::new(ServerLocks::new());
        Self {
            store,
            projects,
            channel,
            executor: Arc::new(StandardStageExecutor::new(locks.clone())),
            locks,
            notifier: Notifier::default(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the stage executor; it must share `self.locks`
    pub fn with_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Settings of a project, or `NotFound`
    pub fn project(&self, id: Uuid) -> Result<ProjectSettings> {
        self.projects
            .project(id)
            .ok_or_else(|| EngineError::NotFound(format!("Project {}", id)))
    }
}
