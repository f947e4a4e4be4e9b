//! Fixtures shared by the orchestrator's unit tests

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use keel_core::domain::project::ProjectSettings;
use keel_core::domain::stage::{StageDefinition, StageType};
use keel_runner::channel::ScriptedChannel;
use uuid::Uuid;

use crate::engine::{Engine, EngineSettings};
use crate::inventory::Inventory;
use crate::repository::{InMemoryStore, RunHistoryStore, StageDefinitionStore};

pub(crate) fn project(servers: &[&str]) -> ProjectSettings {
    ProjectSettings {
        id: Uuid::new_v4(),
        slug: "shop".to_string(),
        servers: servers.iter().map(|s| s.to_string()).collect(),
        deploy_path: "/var/www/shop".to_string(),
        auto_rollback: false,
        rollback_excludes: vec!["storage".to_string()],
        stop_command: Some("systemctl stop shop".to_string()),
        start_command: Some("systemctl start shop".to_string()),
        health_check_command: Some("curl -fsS http://localhost/health".to_string()),
        migration_down_command: Some("php artisan migrate:down {migration}".to_string()),
        migration_status_command: None,
        manifest_command: None,
        environment: BTreeMap::new(),
    }
}

pub(crate) struct Harness {
    pub engine: Engine,
    pub store: Arc<InMemoryStore>,
    pub channel: ScriptedChannel,
    pub project: ProjectSettings,
}

pub(crate) fn harness(project: ProjectSettings, channel: ScriptedChannel) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(
        store.clone(),
        Arc::new(Inventory::from_projects(vec![project.clone()])),
        Arc::new(channel.clone()),
    )
    .with_settings(EngineSettings {
        log_flush_interval: Duration::from_millis(50),
        lock_heartbeat_interval: Duration::from_millis(200),
        inspect_timeout: Duration::from_secs(5),
    });

    Harness {
        engine,
        store,
        channel,
        project,
    }
}

impl Harness {
    pub async fn add_stage(
        &self,
        name: &str,
        stage_type: StageType,
        order: i32,
        commands: &[&str],
        continue_on_failure: bool,
    ) -> StageDefinition {
        let now = chrono::Utc::now();
        let stage = StageDefinition {
            id: Uuid::new_v4(),
            project_id: self.project.id,
            name: name.to_string(),
            stage_type,
            order,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            timeout_seconds: 60,
            continue_on_failure,
            enabled: true,
            env_vars: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_stage(&stage).await.unwrap();
        stage
    }

    /// Inserts a deployment row as-is
    pub async fn add_deployment(
        &self,
        server_id: &str,
        commit: &str,
        status: DeploymentStatus,
        age: chrono::Duration,
        migrations: &[&str],
    ) -> Deployment {
        let created_at = chrono::Utc::now() - age;
        let deployment = Deployment {
            id: Uuid::new_v4(),
            project_id: self.project.id,
            server_id: server_id.to_string(),
            run_id: Some(Uuid::new_v4()),
            commit_sha: commit.to_string(),
            branch: "main".to_string(),
            status,
            triggered_by: "manual".to_string(),
            rollback_of: None,
            artifact_path: Some(self.project.release_path(commit)),
            migrations: migrations.iter().map(|m| m.to_string()).collect(),
            files: BTreeMap::new(),
            environment_snapshot: BTreeMap::new(),
            created_at,
            updated_at: created_at,
        };
        self.store.create_deployment(&deployment).await.unwrap();
        deployment
    }
}
