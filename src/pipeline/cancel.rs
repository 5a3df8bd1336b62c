//! Cross-stage cancellation.
//!
//! When enabled on a [`PipelineBuilder`](crate::pipeline::PipelineBuilder),
//! the first failing step body aborts every channel of the pipeline so that
//! no sibling or neighbouring stage stays blocked on a full or empty channel.

use crate::pipeline::channel::ChannelControl;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default)]
pub struct Cancellation {
    triggered: AtomicBool,
    channels: Mutex<Vec<Arc<dyn ChannelControl>>>,
}

impl Cancellation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, channel: Arc<dyn ChannelControl>) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_triggered() {
            channel.abort();
        }
        channels.push(channel);
    }

    /// Abort every registered channel. Only the first call has an effect.
    pub fn trigger(&self, reason: &str) {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!("Cancelling pipeline: {}", reason);
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        for channel in channels.iter() {
            channel.abort();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        f.debug_struct("Cancellation")
            .field("triggered", &self.is_triggered())
            .field("channels", &names)
            .finish()
    }
}
