//! Multi-stage worker pipeline.
//!
//! Items flow left to right through stages connected by bounded channels;
//! shutdown is coordinated right to left from the sink.
//!
//! # Architecture
//!
//! ```text
//! [generator] ──► (channel 1) ──► [transform] ──► (channel 2) ──► [sink]
//!   N threads                       M threads                      K threads
//! ```
//!
//! # Design
//!
//! - **Bounded, batched channels**: producers block when a channel is full,
//!   so a fast stage can never race arbitrarily far ahead of a slow one.
//! - **Explicit buffers**: the builder's types force a sized channel between
//!   every pair of stages.
//! - **Automatic close**: a stage closes its output channel when its last
//!   thread returns, so consumers always observe end of stream.
//! - **Fail after join**: a stage reports its first failure only after all of
//!   its threads have joined.
//! - **Optional cancellation**: with `cancel_on_failure`, the first failure
//!   aborts every channel instead of leaving neighbours blocked.

pub mod builder;
pub mod cancel;
pub mod channel;
pub mod error;
pub mod stage;
pub mod topology;

pub use builder::{Builder, NeedsBuffer, PipelineBuilder};
pub use cancel::Cancellation;
pub use channel::{BoundedChannel, ChannelControl, Emitter, Source};
pub use error::{PipelineError, PipelineResult};
pub use stage::{Stage, StepBody};
pub use topology::{Pipeline, PipelineNode};
