//! The finalized, immutable stage chain and its coordinated shutdown.
//!
//! A [`Pipeline`] holds the sink node; every node owns the node of the stage
//! feeding it. Awaiting walks that chain recursively so stages are awaited
//! source first:
//!
//! ```text
//! await(sink) ─► await(transform) ─► await(generator)
//!                                        close root input (if any)
//!                                        join generator threads
//!                    join transform threads
//!      join sink threads
//! ```
//!
//! Each stage closes its output channel when its last thread returns, so by
//! the time a stage is joined its input channel is guaranteed to be closed
//! and its consumers can only be waiting on buffered data.

use crate::pipeline::cancel::Cancellation;
use crate::pipeline::channel::ChannelControl;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::stage::Stage;
use crate::progress::ProgressLog;
use std::sync::Arc;
use std::time::Duration;

/// One stage of a finalized pipeline.
pub struct PipelineNode {
    name: String,
    previous: Option<Box<PipelineNode>>,
    input: Option<Arc<dyn ChannelControl>>,
    output: Option<Arc<dyn ChannelControl>>,
    stage: Stage,
}

impl PipelineNode {
    pub(crate) fn new(
        name: String,
        previous: Option<Box<PipelineNode>>,
        input: Option<Arc<dyn ChannelControl>>,
        output: Option<Arc<dyn ChannelControl>>,
        stage: Stage,
    ) -> Self {
        Self {
            name,
            previous,
            input,
            output,
            stage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn previous(&self) -> Option<&PipelineNode> {
        self.previous.as_deref()
    }

    fn start(&mut self) -> PipelineResult<()> {
        if let Some(previous) = &mut self.previous {
            previous.start()?;
        }
        self.stage.start()
    }

    /// Await the chain ending at this node, pushing failures in await order.
    ///
    /// Without `keep_going` the walk stops at the first failing stage and
    /// leaves every stage after it unawaited.
    fn await_chain<L>(
        self,
        progress: &L,
        interval: Duration,
        keep_going: bool,
        errors: &mut Vec<PipelineError>,
    ) where
        L: ProgressLog + ?Sized,
    {
        let PipelineNode {
            name,
            previous,
            input,
            stage,
            ..
        } = self;

        match previous {
            Some(previous) => {
                previous.await_chain(progress, interval, keep_going, errors);
                if !keep_going && !errors.is_empty() {
                    tracing::warn!("Not awaiting stage '{}' after upstream failure", name);
                    return;
                }
            }
            None => {
                // Root stage reading a channel fed from outside the pipeline:
                // nothing else will ever close it.
                if let Some(input) = &input {
                    tracing::debug!("Closing root input '{}' of stage '{}'", input.name(), name);
                    input.close();
                }
            }
        }

        if let Err(e) = stage.await_and_log(progress, interval) {
            errors.push(e);
        }
    }
}

/// A finalized chain of stages with a single await entry point.
pub struct Pipeline {
    last: PipelineNode,
    cancel: Option<Arc<Cancellation>>,
}

impl Pipeline {
    pub(crate) fn new(last: PipelineNode, cancel: Option<Arc<Cancellation>>) -> Self {
        Self { last, cancel }
    }

    /// Name of the sink stage.
    pub fn name(&self) -> &str {
        self.last.name()
    }

    fn nodes(&self) -> Vec<&PipelineNode> {
        let mut nodes = Vec::new();
        let mut node = Some(&self.last);
        while let Some(current) = node {
            nodes.push(current);
            node = current.previous();
        }
        nodes.reverse();
        nodes
    }

    /// Stage names from source to sink.
    pub fn stage_names(&self) -> Vec<&str> {
        self.nodes().into_iter().map(|n| n.name()).collect()
    }

    /// Names of the channels between stages, from source to sink.
    pub fn channel_names(&self) -> Vec<&str> {
        self.nodes()
            .into_iter()
            .filter_map(|n| n.output.as_deref())
            .map(|c| c.name())
            .collect()
    }

    pub fn cancels_on_failure(&self) -> bool {
        self.cancel.is_some()
    }

    /// Spawn the threads of every stage, source first. Stages that are
    /// already running are left alone.
    pub fn start(&mut self) -> PipelineResult<()> {
        tracing::info!("Starting pipeline '{}': {}", self.name(), self.stage_names().join(" -> "));
        self.last.start()
    }

    /// Run the pipeline to completion.
    ///
    /// Starts any stage that is not running yet, then awaits every stage
    /// source first, ticking `progress` every `interval` while waiting.
    ///
    /// Without cancellation the first failing stage (in await order) is
    /// reported as soon as its own threads have joined; stages after it may
    /// still be running. With cancellation every stage is awaited and the
    /// first failure that is not a mere interruption is reported.
    pub fn await_and_log<L>(mut self, progress: &L, interval: Duration) -> PipelineResult<()>
    where
        L: ProgressLog + ?Sized,
    {
        self.start()?;

        let name = self.last.name.clone();
        let keep_going = self.cancel.is_some();
        let mut errors = Vec::new();
        self.last.await_chain(progress, interval, keep_going, &mut errors);

        if errors.is_empty() {
            tracing::info!("Pipeline '{}' complete", name);
            return Ok(());
        }

        let first = errors
            .iter()
            .position(|e| !e.is_interruption())
            .unwrap_or(0);
        let error = errors.swap_remove(first);
        tracing::error!("Pipeline '{}' failed: {}", name, error);
        Err(error)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("channels", &self.channel_names())
            .field("cancel_on_failure", &self.cancels_on_failure())
            .finish()
    }
}
