//! `~/.wikisync/config.yaml`: scheduler, workspace, generator and logging knobs.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! [`Config::load_at`] validates the values the scheduler depends on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub workspace: WorkspaceConfig,
    pub generator: GeneratorConfig,
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
    /// Language variant given to branches added without an explicit one.
    pub default_language: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            workspace: WorkspaceConfig::default(),
            generator: GeneratorConfig::default(),
            notifier: NotifierConfig::default(),
            logging: LoggingConfig::default(),
            default_language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub polling_interval_secs: u64,
    /// Delay before the first iteration after daemon start.
    pub startup_delay_secs: u64,
    pub default_update_interval_minutes: u32,
    pub min_update_interval_minutes: u32,
    pub manual_trigger_priority: i32,
    /// Repositories examined per scan phase.
    pub scan_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 60,
            startup_delay_secs: 10,
            default_update_interval_minutes: 60,
            min_update_interval_minutes: 5,
            manual_trigger_priority: 100,
            scan_batch_size: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    /// Effective recheck interval for a repository's optional override.
    pub fn recheck_interval_minutes(&self, repository_override: Option<u32>) -> u32 {
        repository_override
            .unwrap_or(self.default_update_interval_minutes)
            .max(self.min_update_interval_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent of all working copies; defaults to `~/.wikisync/repos`.
    pub repositories_dir: Option<PathBuf>,
    pub cleanup_after_processing: bool,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            repositories_dir: None,
            cleanup_after_processing: false,
            max_retry_attempts: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl WorkspaceConfig {
    pub fn repositories_dir_at(&self, home: &Path) -> PathBuf {
        self.repositories_dir
            .clone()
            .unwrap_or_else(|| paths::default_repositories_dir(home))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GeneratorConfig {
    /// argv of the external generator, e.g. `["deepwiki-gen", "--quiet"]`.
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load `<home>/.wikisync/config.yaml`, falling back to defaults when absent.
    pub fn load_at(home: &Path) -> Result<Self, StoreError> {
        let path = paths::config_path(home);
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            if contents.trim().is_empty() {
                Config::default()
            } else {
                serde_yaml::from_str(&contents)
                    .map_err(|source| StoreError::ConfigParse { path, source })?
            }
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// `load_at` convenience wrapper.
    pub fn load() -> Result<Self, StoreError> {
        Self::load_at(&paths::home()?)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        let scheduler = &self.scheduler;
        if scheduler.polling_interval_secs == 0 {
            return Err(StoreError::InvalidConfig(
                "scheduler.polling_interval_secs must be greater than zero".into(),
            ));
        }
        if scheduler.scan_batch_size == 0 {
            return Err(StoreError::InvalidConfig(
                "scheduler.scan_batch_size must be greater than zero".into(),
            ));
        }
        if scheduler.min_update_interval_minutes > scheduler.default_update_interval_minutes {
            return Err(StoreError::InvalidConfig(format!(
                "scheduler.min_update_interval_minutes ({}) exceeds default_update_interval_minutes ({})",
                scheduler.min_update_interval_minutes, scheduler.default_update_interval_minutes
            )));
        }
        if self.workspace.max_retry_attempts == 0 {
            return Err(StoreError::InvalidConfig(
                "workspace.max_retry_attempts must be at least 1".into(),
            ));
        }
        if let Some(command) = &self.generator.command {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(StoreError::InvalidConfig(
                    "generator.command must name a program".into(),
                ));
            }
        }
        if self.default_language.trim().is_empty() {
            return Err(StoreError::InvalidConfig(
                "default_language must not be empty".into(),
            ));
        }
        Ok(())
    }
}
