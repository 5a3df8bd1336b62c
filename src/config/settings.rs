//! Sizing and logging settings referenced by [`PipelineConfig`](super::PipelineConfig).
//!
//! # Main Types
//!
//! - [`StageSettings`] - Thread count and output channel sizing for one stage
//! - [`LogConfig`] - Log filter and optional log file
//! - [`LogFormat`] - Output format of log lines

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default threads per stage
pub const DEFAULT_THREADS: usize = 1;

/// Default channel capacity in items
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default channel batch size in items
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Thread count for a stage and sizing of the channel it writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Number of threads running the stage's step body
    pub threads: usize,

    /// Capacity of the stage's output channel, in items
    pub queue_capacity: usize,

    /// Items moved per channel transfer
    pub batch_size: usize,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl StageSettings {
    /// Describe what is wrong with these settings, if anything
    pub fn problem(&self) -> Option<String> {
        if self.threads == 0 {
            Some("threads must be at least 1".to_string())
        } else if self.queue_capacity == 0 {
            Some("queue_capacity must be at least 1".to_string())
        } else if self.batch_size == 0 {
            Some("batch_size must be at least 1".to_string())
        } else if self.batch_size > self.queue_capacity {
            Some(format!(
                "batch_size {} exceeds queue_capacity {}",
                self.batch_size, self.queue_capacity
            ))
        } else {
            None
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,

    /// Also write logs to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Log line format
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info,tilepipe=debug".to_string(),
            file: None,
            format: LogFormat::Text,
        }
    }
}

/// Log line format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// Compact single-line format
    Compact,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Compact => write!(f, "compact"),
        }
    }
}
