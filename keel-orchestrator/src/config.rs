//! Orchestrator configuration
//!
//! Defines the configurable parameters of the engine process: database and
//! bind address, inventory location, flush and heartbeat intervals, and ssh
//! client settings.

use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL; without one the engine keeps its state in memory
    pub database_url: Option<String>,

    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// JSON file describing servers and projects
    pub inventory_path: PathBuf,

    /// How often buffered stage output is written to the log table
    pub log_flush_interval: Duration,

    /// How often a running pipeline refreshes its project lock
    pub lock_heartbeat_interval: Duration,

    /// Age after which a lock without heartbeat is reclaimed
    pub lock_stale_after: Duration,

    pub ssh_connect_timeout: Duration,

    /// ssh executable
    pub ssh_binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            inventory_path: PathBuf::from("inventory.json"),
            log_flush_interval: Duration::from_secs(2),
            lock_heartbeat_interval: Duration::from_secs(15),
            lock_stale_after: Duration::from_secs(120),
            ssh_connect_timeout: Duration::from_secs(10),
            ssh_binary: "ssh".to_string(),
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (optional)
    /// - KEEL_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - KEEL_INVENTORY (optional, default: inventory.json)
    /// - KEEL_LOG_FLUSH_INTERVAL (optional, seconds, default: 2)
    /// - KEEL_LOCK_HEARTBEAT_INTERVAL (optional, seconds, default: 15)
    /// - KEEL_LOCK_STALE_AFTER (optional, seconds, default: 120)
    /// - KEEL_SSH_CONNECT_TIMEOUT (optional, seconds, default: 10)
    /// - KEEL_SSH_BINARY (optional, default: ssh)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let seconds = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| anyhow::anyhow!("{} must be a number of seconds, got '{}'", key, value)),
                None => Ok(default),
            }
        };

        let config = Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            bind_addr: lookup("KEEL_BIND_ADDR").unwrap_or(defaults.bind_addr),
            inventory_path: lookup("KEEL_INVENTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.inventory_path),
            log_flush_interval: seconds("KEEL_LOG_FLUSH_INTERVAL", defaults.log_flush_interval)?,
            lock_heartbeat_interval: seconds(
                "KEEL_LOCK_HEARTBEAT_INTERVAL",
                defaults.lock_heartbeat_interval,
            )?,
            lock_stale_after: seconds("KEEL_LOCK_STALE_AFTER", defaults.lock_stale_after)?,
            ssh_connect_timeout: seconds("KEEL_SSH_CONNECT_TIMEOUT", defaults.ssh_connect_timeout)?,
            ssh_binary: lookup("KEEL_SSH_BINARY").unwrap_or(defaults.ssh_binary),
        };

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.log_flush_interval.is_zero() {
            anyhow::bail!("log_flush_interval must be greater than 0");
        }

        if self.lock_heartbeat_interval.is_zero() {
            anyhow::bail!("lock_heartbeat_interval must be greater than 0");
        }

        if self.lock_stale_after <= self.lock_heartbeat_interval {
            anyhow::bail!("lock_stale_after must be longer than lock_heartbeat_interval");
        }

        if self.ssh_binary.is_empty() {
            anyhow::bail!("ssh_binary cannot be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.lock_heartbeat_interval, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://keel@localhost/keel"),
            ("KEEL_LOG_FLUSH_INTERVAL", "5"),
            ("KEEL_INVENTORY", "/etc/keel/inventory.json"),
        ]))
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://keel@localhost/keel"));
        assert_eq!(config.log_flush_interval, Duration::from_secs(5));
        assert_eq!(config.inventory_path, PathBuf::from("/etc/keel/inventory.json"));
    }

    #[test]
    fn test_invalid_number() {
        let err = Config::from_lookup(lookup(&[("KEEL_LOCK_STALE_AFTER", "soon")])).unwrap_err();
        assert!(err.to_string().contains("KEEL_LOCK_STALE_AFTER"));
    }

    #[test]
    fn test_validate_stale_after_heartbeat() {
        let config = Config {
            lock_stale_after: Duration::from_secs(10),
            lock_heartbeat_interval: Duration::from_secs(10),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
