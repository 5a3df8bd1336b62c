//! Periodic progress reporting while a pipeline is awaited.
//!
//! [`Stage::await_and_log`](crate::pipeline::Stage::await_and_log) ticks a
//! [`ProgressLog`] every interval. Any `Fn()` closure works as a progress
//! callback; [`ProgressLogger`] is the stock implementation that prints one
//! line per tick with per-stage throughput and channel occupancy.

use crate::stats::{Stats, StatsSnapshot};
use std::sync::{Arc, Mutex, PoisonError};

/// Callback invoked on every progress tick.
pub trait ProgressLog {
    fn log(&self);
}

impl<F: Fn()> ProgressLog for F {
    fn log(&self) {
        self()
    }
}

/// Logs throughput of every registered stage and occupancy of every channel.
pub struct ProgressLogger {
    label: String,
    stats: Arc<Stats>,
    last: Mutex<Option<StatsSnapshot>>,
}

impl ProgressLogger {
    pub fn new(label: impl Into<String>, stats: Arc<Stats>) -> Self {
        Self {
            label: label.into(),
            stats,
            last: Mutex::new(None),
        }
    }

    /// Build the progress line for the current counters and remember them
    /// as the baseline for the next rate computation.
    pub fn progress_line(&self) -> String {
        let current = self.stats.snapshot();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let line = format_progress(&self.label, &current, last.as_ref());
        *last = Some(current);
        line
    }
}

impl ProgressLog for ProgressLogger {
    fn log(&self) {
        tracing::info!("{}", self.progress_line());
    }
}

impl std::fmt::Debug for ProgressLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressLogger")
            .field("label", &self.label)
            .finish()
    }
}

fn format_progress(label: &str, current: &StatsSnapshot, previous: Option<&StatsSnapshot>) -> String {
    let window = previous
        .map(|p| current.elapsed_secs - p.elapsed_secs)
        .unwrap_or(current.elapsed_secs);

    let mut parts = vec![format!("[{}] {:.0}s", label, current.elapsed_secs)];

    for stage in &current.stages {
        let before = previous
            .and_then(|p| p.stage(&stage.name))
            .map_or(0, |s| s.items_out);
        let rate = if window > 0.0 {
            (stage.items_out.saturating_sub(before)) as f64 / window
        } else {
            0.0
        };
        parts.push(format!(
            "{}: {} out ({}/s) {}/{} threads",
            stage.name,
            format_count(stage.items_out),
            format_count(rate as u64),
            stage.threads_alive,
            stage.threads
        ));
    }

    for queue in &current.queues {
        parts.push(format!(
            "{} {}/{}",
            queue.name,
            format_count(queue.occupancy),
            format_count(queue.capacity as u64)
        ));
    }

    parts.join(" | ")
}

/// Format a count with a k/M/G suffix.
pub fn format_count(count: u64) -> String {
    const K: f64 = 1_000.0;
    let value = count as f64;
    if value >= K * K * K {
        format!("{:.1}G", value / (K * K * K))
    } else if value >= K * K {
        format!("{:.1}M", value / (K * K))
    } else if value >= K {
        format!("{:.1}k", value / K)
    } else {
        count.to_string()
    }
}
