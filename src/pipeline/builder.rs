//! Type-checked construction of a linear stage chain.
//!
//! Every pair of adjacent stages must be separated by an explicitly sized
//! channel. The types enforce this: attaching a stage yields a
//! [`NeedsBuffer`], whose only operation is [`NeedsBuffer::add_buffer`], and
//! only the resulting [`Builder`] can attach the next stage.
//!
//! ```
//! use tilepipe::{PipelineBuilder, Stats};
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! let stats = Stats::new();
//! let out = Arc::new(Mutex::new(Vec::new()));
//! let sink = out.clone();
//!
//! let pipeline = PipelineBuilder::new(stats)
//!     .from_generator("read", 1, |emit| {
//!         for x in 1..=5u32 {
//!             emit.emit(x)?;
//!         }
//!         Ok(())
//!     })
//!     .add_buffer("raw", 4, 2)
//!     .add_worker("double", 1, |next, emit| {
//!         for x in next {
//!             emit.emit(x * 2)?;
//!         }
//!         Ok(())
//!     })
//!     .add_buffer("doubled", 4, 2)
//!     .sink_to_consumer("collect", 1, move |x| sink.lock().unwrap().push(x));
//!
//! pipeline.await_and_log(&|| {}, Duration::from_secs(1)).unwrap();
//! assert_eq!(*out.lock().unwrap(), vec![2, 4, 6, 8, 10]);
//! ```

use crate::pipeline::cancel::Cancellation;
use crate::pipeline::channel::{BoundedChannel, ChannelControl, Emitter, Source};
use crate::pipeline::stage::{Stage, StepBody};
use crate::pipeline::topology::{Pipeline, PipelineNode};
use crate::stats::{StageStats, Stats};
use std::sync::{Arc, Mutex, PoisonError};

/// State shared by every link of one builder chain.
#[derive(Clone)]
struct BuildContext {
    stats: Arc<Stats>,
    cancel: Option<Arc<Cancellation>>,
}

impl BuildContext {
    fn channel<T: Send + 'static>(
        &self,
        name: &str,
        capacity: usize,
        batch_size: usize,
    ) -> Arc<BoundedChannel<T>> {
        let channel = Arc::new(BoundedChannel::new(name, capacity, batch_size, &self.stats));
        if let Some(cancel) = &self.cancel {
            cancel.register(channel.clone());
        }
        channel
    }

    fn stage(&self, name: &str, threads: usize, body: StepBody) -> Stage {
        Stage::new(name, &self.stats, threads, body).with_cancellation(self.cancel.clone())
    }
}

/// Entry point of the builder chain.
pub struct PipelineBuilder {
    ctx: BuildContext,
}

impl PipelineBuilder {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            ctx: BuildContext {
                stats,
                cancel: None,
            },
        }
    }

    /// Abort every channel of the pipeline as soon as any step body fails.
    pub fn cancel_on_failure(mut self, enabled: bool) -> Self {
        self.ctx.cancel = enabled.then(Cancellation::new);
        self
    }

    /// Start the chain with a generator stage running `produce` on `threads` threads.
    pub fn from_generator<T, F>(self, name: &str, threads: usize, produce: F) -> NeedsBuffer<T>
    where
        T: Send + 'static,
        F: Fn(&mut Emitter<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let produce = Arc::new(produce);
        NeedsBuffer {
            ctx: self.ctx,
            name: name.to_string(),
            threads,
            previous: None,
            input: None,
            make_body: Box::new(
                move |output: Arc<BoundedChannel<T>>, stage_stats: Arc<StageStats>| -> StepBody {
                    Arc::new(move || {
                        let mut emitter = Emitter::new(output.clone(), Some(stage_stats.clone()));
                        finish_emitting(produce(&mut emitter), &mut emitter)
                    })
                },
            ),
        }
    }

    /// Single-threaded generator.
    pub fn from_generator_single<T, F>(self, name: &str, produce: F) -> NeedsBuffer<T>
    where
        T: Send + 'static,
        F: Fn(&mut Emitter<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.from_generator(name, 1, produce)
    }

    /// Single-threaded generator draining an iterator.
    pub fn read_from_iter<T, I>(self, name: &str, items: I) -> NeedsBuffer<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let items = Mutex::new(items.into_iter());
        self.from_generator(name, 1, move |emit| {
            let mut items = items.lock().unwrap_or_else(PoisonError::into_inner);
            for item in items.by_ref() {
                emit.emit(item)?;
            }
            Ok(())
        })
    }

    /// Start the chain from a channel fed outside of the pipeline.
    ///
    /// The first stage attached to the returned builder becomes the root of
    /// the pipeline; awaiting the pipeline closes `channel`, so whoever feeds
    /// it must be done by then.
    pub fn read_from_channel<T: Send + 'static>(self, channel: Arc<BoundedChannel<T>>) -> Builder<T> {
        if let Some(cancel) = &self.ctx.cancel {
            cancel.register(channel.clone());
        }
        Builder {
            ctx: self.ctx,
            node: None,
            output: channel,
        }
    }
}

type MakeBody<T> = Box<dyn FnOnce(Arc<BoundedChannel<T>>, Arc<StageStats>) -> StepBody + Send>;

/// A stage whose output channel has not been sized yet.
#[must_use = "a stage only runs once its output buffer is added"]
pub struct NeedsBuffer<T> {
    ctx: BuildContext,
    name: String,
    threads: usize,
    previous: Option<Box<BuilderNode>>,
    input: Option<Arc<dyn ChannelControl>>,
    make_body: MakeBody<T>,
}

impl<T: Send + 'static> NeedsBuffer<T> {
    /// Size the channel this stage writes to.
    pub fn add_buffer(self, name: &str, capacity: usize, batch_size: usize) -> Builder<T> {
        let output = self.ctx.channel::<T>(name, capacity, batch_size);
        let body = (self.make_body)(output.clone(), self.ctx.stats.stage(&self.name));
        let stage = self
            .ctx
            .stage(&self.name, self.threads, body)
            .with_output(output.clone());

        let node = BuilderNode {
            name: self.name,
            previous: self.previous,
            input: self.input,
            output: output.clone(),
            stage,
        };

        Builder {
            ctx: self.ctx,
            node: Some(node),
            output,
        }
    }

    /// Size the channel this stage writes to, moving items one at a time.
    pub fn add_buffer_unbatched(self, name: &str, capacity: usize) -> Builder<T> {
        self.add_buffer(name, capacity, 1)
    }
}

/// A chain whose last channel is sized and ready to be read.
#[must_use = "a builder does nothing until the chain ends in a sink"]
pub struct Builder<T> {
    ctx: BuildContext,
    node: Option<BuilderNode>,
    output: Arc<BoundedChannel<T>>,
}

impl<T: Send + 'static> Builder<T> {
    /// Attach an intermediate stage reading this chain's last channel.
    pub fn add_worker<O, F>(self, name: &str, threads: usize, step: F) -> NeedsBuffer<O>
    where
        O: Send + 'static,
        F: Fn(&mut Source<T>, &mut Emitter<O>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let input = self.output;
        let step = Arc::new(step);
        let body_input = input.clone();
        NeedsBuffer {
            ctx: self.ctx,
            name: name.to_string(),
            threads,
            previous: self.node.map(Box::new),
            input: Some(input as Arc<dyn ChannelControl>),
            make_body: Box::new(
                move |output: Arc<BoundedChannel<O>>, stage_stats: Arc<StageStats>| -> StepBody {
                    Arc::new(move || {
                        let mut source = Source::new(body_input.clone(), Some(stage_stats.clone()));
                        let mut emitter = Emitter::new(output.clone(), Some(stage_stats.clone()));
                        finish_emitting(step(&mut source, &mut emitter), &mut emitter)
                    })
                },
            ),
        }
    }

    /// Attach the terminal stage and finalize the chain.
    pub fn sink_to<F>(self, name: &str, threads: usize, step: F) -> Pipeline
    where
        F: Fn(&mut Source<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let input = self.output.clone();
        let stage_stats = self.ctx.stats.stage(name);
        let body: StepBody = Arc::new(move || {
            let mut source = Source::new(input.clone(), Some(stage_stats.clone()));
            step(&mut source)
        });
        let stage = self.ctx.stage(name, threads, body);

        let last = PipelineNode::new(
            name.to_string(),
            self.node.map(|node| Box::new(node.finalize())),
            Some(self.output as Arc<dyn ChannelControl>),
            None,
            stage,
        );
        Pipeline::new(last, self.ctx.cancel)
    }

    /// Attach a terminal stage that hands every item to `handler`.
    pub fn sink_to_consumer<F>(self, name: &str, threads: usize, handler: F) -> Pipeline
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.sink_to(name, threads, move |source| {
            for item in source {
                handler(item);
            }
            Ok(())
        })
    }

    /// The last sized channel of the chain.
    pub fn output(&self) -> &Arc<BoundedChannel<T>> {
        &self.output
    }
}

/// One attached stage, owning the node of the stage before it.
struct BuilderNode {
    name: String,
    previous: Option<Box<BuilderNode>>,
    input: Option<Arc<dyn ChannelControl>>,
    output: Arc<dyn ChannelControl>,
    stage: Stage,
}

impl BuilderNode {
    /// Convert the chain ending at this node, producer end first.
    fn finalize(self) -> PipelineNode {
        let previous = self.previous.map(|node| Box::new(node.finalize()));
        PipelineNode::new(
            self.name,
            previous,
            self.input,
            Some(self.output),
            self.stage,
        )
    }
}

/// Flush what the body emitted, even after a failure, and report the body's
/// error before any flush error.
fn finish_emitting<T: Send>(
    result: anyhow::Result<()>,
    emitter: &mut Emitter<T>,
) -> anyhow::Result<()> {
    let flushed = emitter.flush();
    result?;
    flushed?;
    Ok(())
}
