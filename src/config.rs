//! Configuration loading and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration, loaded from a TOML file with per-field defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the SQLite task store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Scheduler concurrency bound.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Base git repository that task workspaces branch from.
    #[serde(default = "default_base_repo")]
    pub base_repo: PathBuf,

    /// Directory that per-task worktrees are created under.
    #[serde(default = "default_worktrees_base")]
    pub worktrees_base: PathBuf,

    /// Directory for per-task raw agent logs (`task-{id}.log`).
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Scheduler poll cadence in seconds. Overridable for tests.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// When non-empty, mutating API calls must carry this value in the
    /// `x-api-key` header.
    #[serde(default)]
    pub api_credential: String,

    /// Agent executable invoked per task.
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,

    /// Address the HTTP server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_concurrent: default_max_concurrent(),
            base_repo: default_base_repo(),
            worktrees_base: default_worktrees_base(),
            log_dir: default_log_dir(),
            poll_interval_secs: default_poll_interval_secs(),
            api_credential: String::new(),
            agent_cmd: default_agent_cmd(),
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tasks.db")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_base_repo() -> PathBuf {
    PathBuf::from("/home/ubuntu/project")
}

fn default_worktrees_base() -> PathBuf {
    PathBuf::from("/home/ubuntu/worktrees")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/home/ubuntu/task-logs")
}

fn default_poll_interval_secs() -> f64 {
    2.0
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8420".to_string()
}

impl Config {
    /// Load configuration from the given TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from `agent-dispatch.toml` in the working directory if present,
    /// otherwise fall back to defaults.
    pub fn load_or_default() -> Self {
        let candidate = Path::new("agent-dispatch.toml");
        if candidate.exists() {
            match Self::load(candidate) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("ignoring unreadable config file: {e:#}");
                }
            }
        }
        Self::default()
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.poll_interval_secs)
    }

    /// Ensure directories the server writes to exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        std::fs::create_dir_all(&self.worktrees_base)
            .with_context(|| format!("failed to create {}", self.worktrees_base.display()))?;
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.db_path, PathBuf::from("tasks.db"));
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.base_repo, PathBuf::from("/home/ubuntu/project"));
        assert_eq!(config.log_dir, PathBuf::from("/home/ubuntu/task-logs"));
        assert!((config.poll_interval_secs - 2.0).abs() < f64::EPSILON);
        assert!(config.api_credential.is_empty());
        assert_eq!(config.agent_cmd, "claude");
    }

    #[test]
    fn partial_toml_fills_missing_fields() {
        let config: Config = toml::from_str(
            r#"
            max_concurrent = 7
            poll_interval_secs = 0.05
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent, 7);
        assert!((config.poll_interval_secs - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.agent_cmd, "claude");
        assert_eq!(config.db_path, PathBuf::from("tasks.db"));
    }
}
