//! Configuration module for tilepipe
//!
//! A run is described by a [`PipelineConfig`], normally read from a TOML
//! file:
//!
//! ```toml
//! log_interval_secs = 5
//! cancel_on_failure = true
//! stats_output = "stats.json"
//!
//! [log]
//! level = "info"
//!
//! [defaults]
//! threads = 2
//! queue_capacity = 50000
//! batch_size = 500
//!
//! [stages.classify]
//! threads = 8
//! ```
//!
//! Stages without an entry under `[stages]` use `[defaults]`.
//!
//! # Example
//!
//! ```ignore
//! use tilepipe::config::PipelineConfig;
//!
//! let config = PipelineConfig::load("pipeline.toml")?;
//! let classify = config.stage("classify");
//! let builder = config.builder(stats);
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{Result, TilepipeError};
use crate::pipeline::PipelineBuilder;
use crate::stats::Stats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default seconds between progress log lines
pub const DEFAULT_LOG_INTERVAL_SECS: u64 = 10;

/// Complete configuration of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds between progress log lines while awaiting
    pub log_interval_secs: u64,

    /// Abort every channel as soon as any stage fails
    pub cancel_on_failure: bool,

    /// Write a JSON stats snapshot here when the run ends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_output: Option<PathBuf>,

    /// Logging configuration
    pub log: LogConfig,

    /// Settings for stages without an explicit entry
    pub defaults: StageSettings,

    /// Per-stage overrides keyed by stage name
    pub stages: BTreeMap<String, StageSettings>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_interval_secs: DEFAULT_LOG_INTERVAL_SECS,
            cancel_on_failure: false,
            stats_output: None,
            log: LogConfig::default(),
            defaults: StageSettings::default(),
            stages: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TilepipeError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TilepipeError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content).map_err(|e| e.with_context(format!("{:?}", path)))
    }

    /// Load a configuration file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Save the configuration to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TilepipeError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TilepipeError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            TilepipeError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check every stage setting
    pub fn validate(&self) -> Result<()> {
        if let Some(problem) = self.defaults.problem() {
            return Err(TilepipeError::Config(format!("[defaults]: {}", problem)));
        }
        for (name, settings) in &self.stages {
            if let Some(problem) = settings.problem() {
                return Err(TilepipeError::Config(format!("[stages.{}]: {}", name, problem)));
            }
        }
        Ok(())
    }

    /// Settings for a named stage, falling back to the defaults
    pub fn stage(&self, name: &str) -> StageSettings {
        self.stages.get(name).copied().unwrap_or(self.defaults)
    }

    /// Override the settings of one stage
    pub fn set_stage(&mut self, name: impl Into<String>, settings: StageSettings) {
        self.stages.insert(name.into(), settings);
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs)
    }

    /// Start a pipeline builder that honours `cancel_on_failure`
    pub fn builder(&self, stats: Arc<Stats>) -> PipelineBuilder {
        PipelineBuilder::new(stats).cancel_on_failure(self.cancel_on_failure)
    }
}
