//! `regsync.toml`
//!
//! 欠けているセクションはすべて既定値で埋める。既定はメモリ上の store、
//! registry なし。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{OrchestratorOptions, SchedulerOptions};
use crate::ports::SweepPolicy;
use crate::source::RegistryConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub tasks: TasksConfig,
    pub scheduler: SchedulerConfig,
    pub registries: Vec<RegistryConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// sqlx connection url, e.g. `sqlite://regsync.db`.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub processing_timeout_secs: u64,
    pub max_attempts: u32,
    pub checkpoint_every: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            processing_timeout_secs: 600,
            max_attempts: 3,
            checkpoint_every: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub execute_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub workers_per_type: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            execute_interval_secs: 1,
            sweep_interval_secs: 60,
            workers_per_type: 1,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.kind == StoreKind::Sqlite && self.store.url.is_none() {
            return Err(ConfigError::Invalid("store.url is required for sqlite".into()));
        }
        let t = &self.tasks;
        if t.processing_timeout_secs == 0 || t.max_attempts == 0 || t.checkpoint_every == 0 {
            return Err(ConfigError::Invalid(
                "tasks.* values must be greater than zero".into(),
            ));
        }
        let s = &self.scheduler;
        if s.poll_interval_secs == 0
            || s.execute_interval_secs == 0
            || s.sweep_interval_secs == 0
            || s.workers_per_type == 0
        {
            return Err(ConfigError::Invalid(
                "scheduler.* values must be greater than zero".into(),
            ));
        }

        let mut ids = HashSet::new();
        for registry in &self.registries {
            if registry.id.is_empty() {
                return Err(ConfigError::Invalid("registry id must not be empty".into()));
            }
            if !ids.insert(registry.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate registry id {:?}",
                    registry.id
                )));
            }
            if registry.page_limit == 0 {
                return Err(ConfigError::Invalid(format!(
                    "registry {:?}: page_limit must be greater than zero",
                    registry.id
                )));
            }
            let bad_scope = registry
                .scopes
                .iter()
                .find(|s| !s.starts_with('@') || s.len() < 2);
            if let Some(scope) = bad_scope {
                return Err(ConfigError::Invalid(format!(
                    "registry {:?}: scope {scope:?} must look like \"@name\"",
                    registry.id
                )));
            }
        }
        Ok(())
    }

    pub fn registry(&self, id: &str) -> Option<&RegistryConfig> {
        self.registries.iter().find(|r| r.id == id)
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            processing_timeout: Duration::from_secs(self.tasks.processing_timeout_secs),
            max_attempts: self.tasks.max_attempts,
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            sweep: self.sweep_policy(),
            checkpoint_every: self.tasks.checkpoint_every,
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            poll_interval: Duration::from_secs(self.scheduler.poll_interval_secs),
            execute_interval: Duration::from_secs(self.scheduler.execute_interval_secs),
            sweep_interval: Duration::from_secs(self.scheduler.sweep_interval_secs),
            workers_per_type: self.scheduler.workers_per_type,
        }
    }
}
