//! Error handling for tilepipe
//!
//! This module defines the crate-level error type used by configuration,
//! stats output and the demo binary, plus a Result alias. Errors raised
//! while a pipeline runs live in [`crate::pipeline::PipelineError`] and are
//! wrapped here through the `Pipeline` variant.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for tilepipe operations
#[derive(Error, Debug)]
pub enum TilepipeError {
    /// Errors related to configuration loading/saving/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while running a pipeline
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<TilepipeError>,
    },
}

impl TilepipeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        TilepipeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for tilepipe operations
pub type Result<T> = std::result::Result<T, TilepipeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| TilepipeError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TilepipeError::from(e).with_context(f()))
    }
}
