//! Project settings
//!
//! Projects, their servers and their rollback configuration are owned by an
//! external system. The engine only reads these settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Deployment settings of a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub id: Uuid,
    pub slug: String,
    /// Target servers, in deployment order
    pub servers: Vec<String>,
    /// Base directory on each server (releases live under `<deploy_path>/releases`)
    pub deploy_path: String,
    /// Roll back automatically when a run fails after its deploy phase began
    #[serde(default)]
    pub auto_rollback: bool,
    /// Paths (relative to the release root) never touched by file restoration
    #[serde(default)]
    pub rollback_excludes: Vec<String>,
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub health_check_command: Option<String>,
    /// Reverts one migration; `{migration}` is replaced by its name
    #[serde(default)]
    pub migration_down_command: Option<String>,
    /// Prints applied migration names, one per line
    #[serde(default)]
    pub migration_status_command: Option<String>,
    /// Prints `<digest>  <path>` lines for the release tree
    #[serde(default)]
    pub manifest_command: Option<String>,
    /// Environment exported to every command and captured on each deployment
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ProjectSettings {
    pub fn releases_path(&self) -> String {
        format!("{}/releases", self.deploy_path.trim_end_matches('/'))
    }

    pub fn release_path(&self, commit_sha: &str) -> String {
        format!("{}/{}", self.releases_path(), commit_sha)
    }

    /// Symlink pointing at the live release
    pub fn current_path(&self) -> String {
        format!("{}/current", self.deploy_path.trim_end_matches('/'))
    }

    /// Whether a release-relative path is protected from file restoration
    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./").trim_start_matches('/');
        self.rollback_excludes.iter().any(|exclude| {
            let exclude = exclude.trim_start_matches("./").trim_matches('/');
            !exclude.is_empty()
                && (path == exclude
                    || path
                        .strip_prefix(exclude)
                        .is_some_and(|rest| rest.starts_with('/')))
        })
    }
}
