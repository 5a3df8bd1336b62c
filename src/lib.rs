//! # tilepipe: bounded multi-stage worker pipeline
//!
//! The concurrent execution backbone of a batch map-data pipeline. Input
//! features flow through a chain of stages; every stage runs its step body
//! on its own threads, and adjacent stages are joined by a bounded, batched
//! channel that applies backpressure.
//!
//! ## Architecture
//!
//! - **Channel**: [`BoundedChannel`] moves batches of items between exactly
//!   one producing and one consuming stage, with explicit close
//! - **Stage**: [`Stage`] runs a step body on N threads and reports the first
//!   failure once all of them have joined
//! - **Builder**: [`PipelineBuilder`] forces a sized channel between every
//!   pair of stages at compile time
//! - **Pipeline**: [`Pipeline`] is the finalized chain with a single
//!   `await_and_log` entry point
//! - **Stats/Progress**: [`Stats`] collects per-stage and per-channel
//!   counters; [`ProgressLogger`] turns them into periodic log lines
//!
//! ## Example
//!
//! ```
//! use tilepipe::{PipelineBuilder, ProgressLogger, Stats};
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let stats = Stats::new();
//! let total = Arc::new(AtomicU64::new(0));
//! let sum = total.clone();
//!
//! let pipeline = PipelineBuilder::new(stats.clone())
//!     .read_from_iter("read", 1..=100u64)
//!     .add_buffer("numbers", 32, 8)
//!     .add_worker("square", 4, |next, emit| {
//!         for x in next {
//!             emit.emit(x * x)?;
//!         }
//!         Ok(())
//!     })
//!     .add_buffer("squares", 32, 8)
//!     .sink_to_consumer("sum", 1, move |x| {
//!         sum.fetch_add(x, Ordering::Relaxed);
//!     });
//!
//! let progress = ProgressLogger::new("squares", stats);
//! pipeline.await_and_log(&progress, Duration::from_secs(10)).unwrap();
//! assert_eq!(total.load(Ordering::Relaxed), 338_350);
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod stats;

// Re-export commonly used types
pub use config::{PipelineConfig, StageSettings};
pub use error::{Result, TilepipeError};
pub use pipeline::{
    BoundedChannel, Builder, Emitter, NeedsBuffer, Pipeline, PipelineBuilder, PipelineError,
    PipelineResult, Source, Stage,
};
pub use progress::{ProgressLog, ProgressLogger};
pub use stats::{Stats, StatsSnapshot};
