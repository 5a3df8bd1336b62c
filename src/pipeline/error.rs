//! Pipeline-specific error types.

use thiserror::Error;

/// Errors surfaced when a stage or a whole pipeline is awaited.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A produce/transform/consume body returned an error.
    #[error("Stage '{stage}' thread {thread} failed: {source}")]
    Step {
        stage: String,
        thread: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A step body panicked instead of returning an error.
    #[error("Stage '{stage}' thread {thread} panicked: {message}")]
    Panicked {
        stage: String,
        thread: usize,
        message: String,
    },

    /// A blocked put was woken because the pipeline was cancelled.
    #[error("Channel '{channel}' was aborted")]
    Interrupted { channel: String },

    /// The OS refused to spawn a stage thread.
    #[error("Failed to spawn thread for stage '{stage}': {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Name of the stage this error belongs to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::Step { stage, .. }
            | PipelineError::Panicked { stage, .. }
            | PipelineError::Spawn { stage, .. } => Some(stage),
            PipelineError::Interrupted { .. } => None,
        }
    }

    /// True when the failure is only a consequence of cancellation.
    ///
    /// A step body that propagates an [`Interrupted`](PipelineError::Interrupted)
    /// from `emit` ends up wrapped in a `Step` error, so the source chain is
    /// inspected too.
    pub fn is_interruption(&self) -> bool {
        match self {
            PipelineError::Interrupted { .. } => true,
            PipelineError::Step { source, .. } => source
                .chain()
                .any(|cause| matches!(cause.downcast_ref::<PipelineError>(), Some(PipelineError::Interrupted { .. }))),
            _ => false,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_display() {
        let err = PipelineError::Step {
            stage: "classify".to_string(),
            thread: 2,
            source: anyhow::anyhow!("bad geometry"),
        };
        assert_eq!(
            err.to_string(),
            "Stage 'classify' thread 2 failed: bad geometry"
        );
        assert_eq!(err.stage(), Some("classify"));
        assert!(!err.is_interruption());
    }

    #[test]
    fn test_wrapped_interruption_detected() {
        let interrupted = PipelineError::Interrupted {
            channel: "features".to_string(),
        };
        let err = PipelineError::Step {
            stage: "read".to_string(),
            thread: 0,
            source: anyhow::Error::new(interrupted),
        };
        assert!(err.is_interruption());
    }
}
