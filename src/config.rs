//! Project-level Ralph configuration, read from `.ralph/config.yaml`
//! (SPEC_FULL.md §A.3).
//!
//! Grounded in the host's `ralph_loop::config::ConfigManager`
//! (`.ralph-ui/config.yaml` read/write via `serde_yaml`, defaults when
//! absent) and `merge_config` (CLI overrides win over the file).

use crate::session::types::ErrorStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_max_iterations() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_error_strategy() -> ErrorStrategy {
    ErrorStrategy::AnalyzeRetry
}

/// Project-level defaults a run falls back to when no override is given
/// (spec.md §4.2 "Inputs": `max_iterations`, `error_strategy`, and the
/// quality-check command all have project-level defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphConfig {
    #[serde(default)]
    pub check_command: Option<String>,
    #[serde(default)]
    pub pre_check_command: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_error_strategy")]
    pub error_strategy: ErrorStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            check_command: None,
            pre_check_command: None,
            max_iterations: default_max_iterations(),
            error_strategy: default_error_strategy(),
            max_retries: default_max_retries(),
        }
    }
}

/// Reads and writes `<project>/.ralph/config.yaml`.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(project_path: &Path) -> Self {
        Self {
            config_path: project_path.join(".ralph").join("config.yaml"),
        }
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read the config, falling back to defaults when the file is absent.
    /// The file is never required (SPEC_FULL.md §A.3).
    pub fn read(&self) -> anyhow::Result<RalphConfig> {
        if !self.config_path.exists() {
            return Ok(RalphConfig::default());
        }
        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| anyhow::anyhow!("failed to read {:?}: {}", self.config_path, e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {:?}: {}", self.config_path, e))
    }

    pub fn write(&self, config: &RalphConfig) -> anyhow::Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("failed to create {:?}: {}", parent, e))?;
        }
        let content = serde_yaml::to_string(config)
            .map_err(|e| anyhow::anyhow!("failed to serialize config: {}", e))?;
        std::fs::write(&self.config_path, content)
            .map_err(|e| anyhow::anyhow!("failed to write {:?}: {}", self.config_path, e))
    }
}

/// CLI-style overrides take precedence over the file (SPEC_FULL.md §A.3,
/// host's `merge_config`).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_iterations: Option<u32>,
    pub error_strategy: Option<ErrorStrategy>,
    pub max_retries: Option<u32>,
    pub check_command: Option<String>,
}

pub fn merge_config(file_config: &RalphConfig, overrides: &ConfigOverrides) -> RalphConfig {
    RalphConfig {
        check_command: overrides
            .check_command
            .clone()
            .or_else(|| file_config.check_command.clone()),
        pre_check_command: file_config.pre_check_command.clone(),
        max_iterations: overrides.max_iterations.unwrap_or(file_config.max_iterations),
        error_strategy: overrides.error_strategy.unwrap_or(file_config.error_strategy),
        max_retries: overrides.max_retries.unwrap_or(file_config.max_retries),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        let config = manager.read().unwrap();
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.error_strategy, ErrorStrategy::AnalyzeRetry);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        let mut config = RalphConfig::default();
        config.max_iterations = 10;
        config.check_command = Some("cargo test".into());
        manager.write(&config).unwrap();

        let read_back = manager.read().unwrap();
        assert_eq!(read_back.max_iterations, 10);
        assert_eq!(read_back.check_command.as_deref(), Some("cargo test"));
    }

    #[test]
    fn overrides_win_over_file_values() {
        let file_config = RalphConfig {
            max_iterations: 50,
            error_strategy: ErrorStrategy::Skip,
            ..RalphConfig::default()
        };
        let overrides = ConfigOverrides {
            max_iterations: Some(5),
            ..ConfigOverrides::default()
        };
        let merged = merge_config(&file_config, &overrides);
        assert_eq!(merged.max_iterations, 5);
        assert_eq!(merged.error_strategy, ErrorStrategy::Skip);
    }
}
