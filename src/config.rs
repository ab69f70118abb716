use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "threadpilot.toml";

/// Bot configuration from `threadpilot.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the store files and the running marker.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub claude: ClaudeConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// How to launch the assistant CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments that put the CLI into streaming structured I/O mode.
    #[serde(default = "default_base_args")]
    pub base_args: Vec<String>,
    /// Appended after the base arguments (e.g. `--permission-mode acceptEdits`).
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Time between SIGTERM and SIGKILL when stopping a runner.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Idle time after which a thread's subprocess is stopped.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Age after which thread mappings and question payloads are evicted.
    #[serde(default = "default_mapping_ttl_secs")]
    pub mapping_ttl_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".threadpilot")
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_base_args() -> Vec<String> {
    [
        "-p",
        "--output-format",
        "stream-json",
        "--verbose",
        "--input-format",
        "stream-json",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_inactivity_timeout_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_mapping_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            claude: ClaudeConfig::default(),
            sessions: SessionsConfig::default(),
        }
    }
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            base_args: default_base_args(),
            extra_args: Vec::new(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            mapping_ttl_secs: default_mapping_ttl_secs(),
        }
    }
}

impl ClaudeConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl SessionsConfig {
    pub fn inactivity_timeout(&self) -> chrono::TimeDelta {
        secs_delta(self.inactivity_timeout_secs)
    }

    pub fn mapping_ttl(&self) -> chrono::TimeDelta {
        secs_delta(self.mapping_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn secs_delta(secs: u64) -> chrono::TimeDelta {
    chrono::TimeDelta::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX))
        .unwrap_or(chrono::TimeDelta::MAX)
}

/// Load configuration from `path`.
///
/// Falls back to defaults if the file is missing.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.claude.program, "claude");
        assert_eq!(config.sessions.inactivity_timeout_secs, 1800);
        assert_eq!(config.sessions.mapping_ttl_secs, 86_400);
        assert!(config.claude.base_args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threadpilot.toml");
        std::fs::write(
            &path,
            "data_dir = \"/var/lib/tp\"\n[claude]\nextra_args = [\"--permission-mode\", \"acceptEdits\"]\n[sessions]\ninactivity_timeout_secs = 60\n",
        )
        .unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/tp"));
        assert_eq!(config.claude.program, "claude");
        assert_eq!(config.claude.extra_args.len(), 2);
        assert_eq!(config.sessions.inactivity_timeout(), chrono::TimeDelta::seconds(60));
        assert_eq!(config.sessions.sweep_interval_secs, 3600);
    }

    #[test]
    fn invalid_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threadpilot.toml");
        std::fs::write(&path, "data_dir = [").unwrap();
        assert!(load(&path).is_err());
    }
}
