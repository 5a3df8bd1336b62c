//! A named stage running one step body on a fixed number of threads.
//!
//! Lifecycle:
//!
//! ```text
//! CREATED ──start()──► RUNNING ──await_and_log()──► DONE | FAILED
//! ```
//!
//! When the last thread of a stage returns (or fails, or panics) the
//! stage's output channel is closed, so downstream consumers observe end of
//! stream without any help from the orchestrating thread.

use crate::pipeline::cancel::Cancellation;
use crate::pipeline::channel::ChannelControl;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::progress::ProgressLog;
use crate::stats::{StageStats, Stats};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Step body run once by every thread of a stage.
pub type StepBody = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

const MIN_LOG_INTERVAL: Duration = Duration::from_millis(10);

enum StageState {
    Created(StepBody),
    Running(Running),
    // Only observed transiently while moving between the other two.
    Empty,
}

struct Running {
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
    done_rx: Receiver<usize>,
    spawn_error: Option<PipelineError>,
    started_at: Instant,
}

pub struct Stage {
    name: String,
    threads: usize,
    stats: Arc<StageStats>,
    output: Option<Arc<dyn ChannelControl>>,
    cancel: Option<Arc<Cancellation>>,
    state: StageState,
}

impl Stage {
    /// Create a stage. No thread runs until [`Stage::start`].
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero.
    pub fn new(name: impl Into<String>, stats: &Stats, threads: usize, body: StepBody) -> Self {
        let name = name.into();
        assert!(threads > 0, "stage '{name}' needs at least one thread");
        let stage_stats = stats.stage(&name);
        stage_stats.set_threads(threads);
        Self {
            name,
            threads,
            stats: stage_stats,
            output: None,
            cancel: None,
            state: StageState::Created(body),
        }
    }

    /// Channel this stage closes once all of its threads have finished.
    pub fn with_output(mut self, output: Arc<dyn ChannelControl>) -> Self {
        self.output = Some(output);
        self
    }

    /// Cancellation to trigger when a step body fails.
    pub fn with_cancellation(mut self, cancel: Option<Arc<Cancellation>>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, StageState::Running(_))
    }

    /// Spawn the stage's threads. Calling this on a running stage does nothing.
    pub fn start(&mut self) -> PipelineResult<()> {
        let body = match std::mem::replace(&mut self.state, StageState::Empty) {
            StageState::Created(body) => body,
            other => {
                self.state = other;
                return Ok(());
            }
        };

        tracing::info!("Starting stage '{}' with {} threads", self.name, self.threads);

        let (done_tx, done_rx) = unbounded();
        let remaining = Arc::new(AtomicUsize::new(self.threads));
        let mut handles = Vec::with_capacity(self.threads);
        let mut spawn_error = None;

        for index in 0..self.threads {
            let guard = ThreadGuard {
                stage: self.name.clone(),
                index,
                stats: self.stats.clone(),
                output: self.output.clone(),
                cancel: self.cancel.clone(),
                remaining: remaining.clone(),
                done_tx: done_tx.clone(),
            };
            let body = body.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.name, index))
                .spawn(move || {
                    guard.stats.thread_started();
                    let result = body();
                    if let Err(e) = &result {
                        guard.fail(&format!("{e:#}"));
                    }
                    drop(guard);
                    result
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    tracing::error!("Failed to spawn thread {} of stage '{}': {}", index, self.name, source);
                    let unspawned = self.threads - index;
                    if remaining.fetch_sub(unspawned, Ordering::AcqRel) == unspawned {
                        if let Some(output) = &self.output {
                            output.close();
                        }
                    }
                    if let Some(cancel) = &self.cancel {
                        cancel.trigger(&format!("stage '{}' could not spawn threads", self.name));
                    }
                    spawn_error = Some(PipelineError::Spawn {
                        stage: self.name.clone(),
                        source,
                    });
                    break;
                }
            }
        }

        self.state = StageState::Running(Running {
            handles,
            done_rx,
            spawn_error,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Block until every thread of this stage has returned.
    ///
    /// `progress` is ticked every `interval` while waiting. Once all threads
    /// have joined, the first failure in thread-start order is returned. No
    /// thread is abandoned to report a failure earlier.
    pub fn await_and_log<L>(mut self, progress: &L, interval: Duration) -> PipelineResult<()>
    where
        L: ProgressLog + ?Sized,
    {
        self.start()?;
        let running = match std::mem::replace(&mut self.state, StageState::Empty) {
            StageState::Running(running) => running,
            _ => unreachable!("stage '{}' is running after start", self.name),
        };

        let interval = interval.max(MIN_LOG_INTERVAL);
        let total = running.handles.len();
        let mut finished = 0;
        while finished < total {
            match running.done_rx.recv_timeout(interval) {
                Ok(_) => finished += 1,
                Err(RecvTimeoutError::Timeout) => progress.log(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut first_error = None;
        for (index, handle) in running.handles.into_iter().enumerate() {
            let outcome = match handle.join() {
                Ok(Ok(())) => None,
                Ok(Err(source)) => Some(PipelineError::Step {
                    stage: self.name.clone(),
                    thread: index,
                    source,
                }),
                Err(payload) => Some(PipelineError::Panicked {
                    stage: self.name.clone(),
                    thread: index,
                    message: panic_message(payload.as_ref()),
                }),
            };
            if first_error.is_none() {
                first_error = outcome;
            }
        }
        let first_error = first_error.or(running.spawn_error);

        let elapsed = running.started_at.elapsed();
        match &first_error {
            None => tracing::info!(
                "Stage '{}' finished in {:.2}s ({} in, {} out)",
                self.name,
                elapsed.as_secs_f64(),
                self.stats.items_in(),
                self.stats.items_out()
            ),
            Some(e) => tracing::error!(
                "Stage '{}' failed after {:.2}s: {}",
                self.name,
                elapsed.as_secs_f64(),
                e
            ),
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Block until every thread has returned, without progress output.
    pub fn join(self) -> PipelineResult<()> {
        self.await_and_log(&|| {}, Duration::from_secs(3600))
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("started", &self.is_started())
            .finish()
    }
}

/// Per-thread bookkeeping, run on drop so that it also happens on panic.
struct ThreadGuard {
    stage: String,
    index: usize,
    stats: Arc<StageStats>,
    output: Option<Arc<dyn ChannelControl>>,
    cancel: Option<Arc<Cancellation>>,
    remaining: Arc<AtomicUsize>,
    done_tx: Sender<usize>,
}

impl ThreadGuard {
    fn fail(&self, reason: &str) {
        self.stats.add_failure();
        tracing::error!("Stage '{}' thread {} failed: {}", self.stage, self.index, reason);
        if let Some(cancel) = &self.cancel {
            cancel.trigger(&format!("stage '{}' failed", self.stage));
        }
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.fail("panicked");
        }
        self.stats.thread_finished();
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(output) = &self.output {
                output.close();
            }
        }
        let _ = self.done_tx.send(self.index);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
