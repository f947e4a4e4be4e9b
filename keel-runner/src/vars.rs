//! Command variables
//!
//! Stage commands may reference run metadata with `{{NAME}}` placeholders.
//! The same values are exported to every command as `KEEL_*` variables.

use std::collections::BTreeMap;

/// Values available to the commands of one stage on one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandVars {
    pub project_slug: String,
    pub project_path: String,
    pub branch: String,
    pub commit_sha: String,
    pub run_number: i64,
    pub server_id: String,
}

impl CommandVars {
    fn pairs(&self) -> [(&'static str, String); 6] {
        [
            ("PROJECT_SLUG", self.project_slug.clone()),
            ("PROJECT_PATH", self.project_path.clone()),
            ("BRANCH", self.branch.clone()),
            ("COMMIT_HASH", self.commit_sha.clone()),
            ("RUN_NUMBER", self.run_number.to_string()),
            ("SERVER", self.server_id.clone()),
        ]
    }

    /// Replaces known `{{NAME}}` placeholders; unknown ones are left untouched
    pub fn render(&self, command: &str) -> String {
        let mut rendered = command.to_string();
        for (name, value) in self.pairs() {
            rendered = rendered.replace(&format!("{{{{{}}}}}", name), &value);
        }
        rendered
    }

    /// `KEEL_<NAME>` environment variables
    pub fn env(&self) -> BTreeMap<String, String> {
        self.pairs()
            .into_iter()
            .map(|(name, value)| (format!("KEEL_{}", name), value))
            .collect()
    }
}

/// Merges environments; later layers override earlier ones
pub fn layered_env<'a, I>(layers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    let mut env = BTreeMap::new();
    for layer in layers {
        env.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> CommandVars {
        CommandVars {
            project_slug: "shop".to_string(),
            project_path: "/var/www/shop".to_string(),
            branch: "main".to_string(),
            commit_sha: "abc123".to_string(),
            run_number: 42,
            server_id: "web-1".to_string(),
        }
    }

    #[test]
    fn test_render_replaces_placeholders() {
        let rendered = vars().render("cd {{PROJECT_PATH}} && git checkout {{COMMIT_HASH}} # {{RUN_NUMBER}}");
        assert_eq!(rendered, "cd /var/www/shop && git checkout abc123 # 42");
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        assert_eq!(vars().render("echo {{SECRET}}"), "echo {{SECRET}}");
    }

    #[test]
    fn test_env_prefixes_names() {
        let env = vars().env();
        assert_eq!(env.get("KEEL_BRANCH").map(String::as_str), Some("main"));
        assert_eq!(env.get("KEEL_SERVER").map(String::as_str), Some("web-1"));
        assert_eq!(env.len(), 6);
    }

    #[test]
    fn test_layered_env_overrides() {
        let mut base = BTreeMap::new();
        base.insert("APP_ENV".to_string(), "staging".to_string());
        base.insert("DEBUG".to_string(), "0".to_string());
        let mut stage = BTreeMap::new();
        stage.insert("APP_ENV".to_string(), "production".to_string());

        let env = layered_env([&base, &stage]);
        assert_eq!(env["APP_ENV"], "production");
        assert_eq!(env["DEBUG"], "0");
    }
}
