//! Inventory
//!
//! Servers and project settings are owned outside the engine. They are read
//! from a JSON file at startup:
//!
//! ```json
//! {
//!   "servers": [{ "id": "web-1", "host": "10.0.0.5", "user": "deploy" }],
//!   "projects": [{ "id": "...", "slug": "shop", "servers": ["web-1"], "deploy_path": "/var/www/shop" }]
//! }
//! ```

use anyhow::Context;
use keel_core::domain::project::ProjectSettings;
use keel_runner::channel::SshTarget;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

/// Read access to project settings
pub trait ProjectDirectory: Send + Sync {
    fn project(&self, id: Uuid) -> Option<ProjectSettings>;
}

/// A server entry of the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    #[serde(flatten)]
    pub target: SshTarget,
}

/// Servers and projects known to the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub projects: Vec<ProjectSettings>,
}

impl Inventory {
    /// Inventory without ssh targets, for local and test setups
    pub fn from_projects(projects: Vec<ProjectSettings>) -> Self {
        Self {
            servers: Vec::new(),
            projects,
        }
    }

    /// Loads and validates an inventory file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory {}", path.display()))?;
        let inventory: Inventory = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse inventory {}", path.display()))?;
        inventory.validate()?;
        Ok(inventory)
    }

    /// Checks ids are unique and every project server is declared
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut server_ids = HashSet::new();
        for server in &self.servers {
            if !server_ids.insert(server.id.as_str()) {
                anyhow::bail!("server '{}' declared twice", server.id);
            }
        }

        let mut project_ids = HashSet::new();
        for project in &self.projects {
            if !project_ids.insert(project.id) {
                anyhow::bail!("project {} declared twice", project.id);
            }
            if project.servers.is_empty() {
                anyhow::bail!("project '{}' has no servers", project.slug);
            }
            if project.deploy_path.trim().is_empty() {
                anyhow::bail!("project '{}' has no deploy_path", project.slug);
            }
            if let Some(unknown) = project
                .servers
                .iter()
                .find(|s| !server_ids.contains(s.as_str()))
            {
                anyhow::bail!("project '{}' uses unknown server '{}'", project.slug, unknown);
            }
        }

        Ok(())
    }

    /// Server id -> ssh target, for the ssh channel
    pub fn ssh_targets(&self) -> HashMap<String, SshTarget> {
        self.servers
            .iter()
            .map(|s| (s.id.clone(), s.target.clone()))
            .collect()
    }
}

impl ProjectDirectory for Inventory {
    fn project(&self, id: Uuid) -> Option<ProjectSettings> {
        self.projects.iter().find(|p| p.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory(json: serde_json::Value) -> Inventory {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_parse_and_lookup() {
        let id = Uuid::new_v4();
        let inventory = inventory(serde_json::json!({
            "servers": [
                { "id": "web-1", "host": "10.0.0.5", "user": "deploy" },
                { "id": "web-2", "host": "10.0.0.6", "port": 2222, "user": "deploy" }
            ],
            "projects": [
                { "id": id, "slug": "shop", "servers": ["web-1", "web-2"], "deploy_path": "/var/www/shop" }
            ]
        }));

        assert!(inventory.validate().is_ok());
        assert_eq!(inventory.project(id).unwrap().slug, "shop");
        assert!(inventory.project(Uuid::new_v4()).is_none());

        let targets = inventory.ssh_targets();
        assert_eq!(targets["web-1"].port, 22);
        assert_eq!(targets["web-2"].port, 2222);
    }

    #[test]
    fn test_unknown_server_rejected() {
        let inventory = inventory(serde_json::json!({
            "servers": [{ "id": "web-1", "host": "10.0.0.5", "user": "deploy" }],
            "projects": [
                { "id": Uuid::new_v4(), "slug": "shop", "servers": ["db-1"], "deploy_path": "/srv/shop" }
            ]
        }));

        let err = inventory.validate().unwrap_err();
        assert!(err.to_string().contains("db-1"));
    }

    #[test]
    fn test_duplicate_server_rejected() {
        let inventory = inventory(serde_json::json!({
            "servers": [
                { "id": "web-1", "host": "a", "user": "deploy" },
                { "id": "web-1", "host": "b", "user": "deploy" }
            ]
        }));
        assert!(inventory.validate().is_err());
    }
}
