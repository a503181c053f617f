use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SkillchainError};

/// Top-level skillchain configuration (`skillchain.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of nodes executing at once within a phase.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Whole-run deadline in seconds (0 = none).
    #[serde(default)]
    pub run_timeout_secs: u64,
    /// Default per-node timeout in seconds (0 = none).
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            run_timeout_secs: 0,
            node_timeout_secs: default_node_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        (self.node_timeout_secs > 0).then(|| Duration::from_secs(self.node_timeout_secs))
    }
}

fn default_concurrency_limit() -> usize { 4 }
fn default_node_timeout() -> u64 { 300 }

/// Where skill manifests are discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Skill root directories, searched in order.
    #[serde(default = "default_skill_dirs")]
    pub dirs: Vec<String>,
    /// Register the in-process builtin skills (default: true).
    #[serde(default = "default_builtins")]
    pub builtins: bool,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dirs: default_skill_dirs(),
            builtins: default_builtins(),
        }
    }
}

fn default_skill_dirs() -> Vec<String> { vec!["skills".to_string()] }
fn default_builtins() -> bool { true }

/// Execution history backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub backend: RecorderBackend,
    /// SQLite database path (sqlite backend only).
    #[serde(default = "default_recorder_path")]
    pub path: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            backend: RecorderBackend::Memory,
            path: default_recorder_path(),
        }
    }
}

fn default_recorder_path() -> String { "runs.db".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Logging level: 1 = run summary only, 2 = per-node (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SkillchainError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| SkillchainError::Config(e.to_string()))?;
        config.validate()?;
        debug!(
            path = %path.display(),
            skill_dirs = config.skills.dirs.len(),
            recorder = ?config.recorder.backend,
            "Config loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.concurrency_limit == 0 {
            return Err(SkillchainError::Config(
                "engine.concurrency_limit must be at least 1".into(),
            ));
        }
        if let Some(ref log) = self.log {
            if !(1..=2).contains(&log.level) {
                return Err(SkillchainError::Config(format!(
                    "log.level must be 1 or 2, got {}",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Skill directories with `~/` expanded.
    pub fn skill_dirs(&self) -> Vec<PathBuf> {
        self.skills.dirs.iter().map(|d| expand_home(d)).collect()
    }

    pub fn recorder_path(&self) -> PathBuf {
        expand_home(&self.recorder.path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    warn!(var = %var_name, "Environment variable not set, keeping placeholder");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_SKILLCHAIN_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_SKILLCHAIN_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_SKILLCHAIN_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_SKILLCHAIN_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_SKILLCHAIN_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.concurrency_limit, 4);
        assert_eq!(config.engine.run_timeout(), None);
        assert_eq!(config.engine.node_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.skills.dirs, vec!["skills"]);
        assert!(config.skills.builtins);
        assert_eq!(config.recorder.backend, RecorderBackend::Memory);
        assert!(config.log.is_none());
    }

    #[test]
    fn test_log_section_defaults() {
        let config: AppConfig = toml::from_str("[log]\n").unwrap();
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 2);
        assert_eq!(log.log_dir, "logs");
    }

    #[test]
    fn test_zero_node_timeout_disables() {
        let config: AppConfig = toml::from_str("[engine]\nnode_timeout_secs = 0\n").unwrap();
        assert_eq!(config.engine.node_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config: AppConfig = toml::from_str("[engine]\nconcurrency_limit = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(SkillchainError::Config(_))));
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = dirs_home() {
            assert_eq!(expand_home("~/skills"), home.join("skills"));
        }
        assert_eq!(expand_home("./skills"), PathBuf::from("./skills"));
    }
}
