//! Process-wide statistics sink shared by every stage and channel.
//!
//! Stages and channels register themselves by name and then only touch
//! atomics on the hot path. The registry itself sits behind a mutex that is
//! taken at registration and snapshot time only.
//!
//! # Example
//!
//! ```
//! use tilepipe::Stats;
//!
//! let stats = Stats::new();
//! let stage = stats.stage("classify");
//! stage.add_items_out(3);
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.stages[0].items_out, 3);
//! ```

use crate::error::{Result, TilepipeError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Counters for one named stage.
#[derive(Debug, Default)]
pub struct StageStats {
    threads: AtomicUsize,
    threads_alive: AtomicUsize,
    items_in: AtomicU64,
    items_out: AtomicU64,
    failures: AtomicU64,
}

impl StageStats {
    pub fn set_threads(&self, threads: usize) {
        self.threads.store(threads, Ordering::Relaxed);
    }

    pub fn thread_started(&self) {
        self.threads_alive.fetch_add(1, Ordering::Relaxed);
    }

    pub fn thread_finished(&self) {
        self.threads_alive.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_items_in(&self, count: u64) {
        self.items_in.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_items_out(&self, count: u64) {
        self.items_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn threads_alive(&self) -> usize {
        self.threads_alive.load(Ordering::Relaxed)
    }

    pub fn items_in(&self) -> u64 {
        self.items_in.load(Ordering::Relaxed)
    }

    pub fn items_out(&self) -> u64 {
        self.items_out.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Occupancy counters for one named channel.
#[derive(Debug)]
pub struct QueueStats {
    capacity: usize,
    batch_size: usize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    blocked_puts: AtomicU64,
}

impl QueueStats {
    fn new(capacity: usize, batch_size: usize) -> Self {
        Self {
            capacity,
            batch_size,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            blocked_puts: AtomicU64::new(0),
        }
    }

    pub fn add_enqueued(&self, count: u64) {
        self.enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dequeued(&self, count: u64) {
        self.dequeued.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a put that found the channel full.
    pub fn add_blocked_put(&self) {
        self.blocked_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub fn blocked_puts(&self) -> u64 {
        self.blocked_puts.load(Ordering::Relaxed)
    }

    /// Items currently buffered (approximate while producers are running).
    pub fn occupancy(&self) -> u64 {
        self.enqueued().saturating_sub(self.dequeued())
    }
}

/// Registry of all stage and channel counters in the process.
#[derive(Debug)]
pub struct Stats {
    started_at: DateTime<Utc>,
    start: Instant,
    stages: Mutex<BTreeMap<String, Arc<StageStats>>>,
    queues: Mutex<BTreeMap<String, Arc<QueueStats>>>,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Utc::now(),
            start: Instant::now(),
            stages: Mutex::new(BTreeMap::new()),
            queues: Mutex::new(BTreeMap::new()),
        })
    }

    /// Get or register the counters for a stage.
    pub fn stage(&self, name: &str) -> Arc<StageStats> {
        let mut stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        stages.entry(name.to_string()).or_default().clone()
    }

    /// Get or register the counters for a channel.
    ///
    /// Re-registering an existing name returns the first registration, so
    /// channels sharing a name add up into one set of counters; the
    /// capacity of the later call is ignored.
    pub fn queue(&self, name: &str, capacity: usize, batch_size: usize) -> Arc<QueueStats> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueStats::new(capacity, batch_size)))
            .clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let stages = self
            .stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, s)| StageSnapshot {
                name: name.clone(),
                threads: s.threads.load(Ordering::Relaxed),
                threads_alive: s.threads_alive(),
                items_in: s.items_in(),
                items_out: s.items_out(),
                failures: s.failures(),
            })
            .collect();

        let queues = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, q)| QueueSnapshot {
                name: name.clone(),
                capacity: q.capacity(),
                batch_size: q.batch_size(),
                enqueued: q.enqueued(),
                dequeued: q.dequeued(),
                occupancy: q.occupancy(),
                blocked_puts: q.blocked_puts(),
            })
            .collect();

        StatsSnapshot {
            started_at: self.started_at,
            taken_at: Utc::now(),
            elapsed_secs: self.elapsed().as_secs_f64(),
            stages,
            queues,
        }
    }

    /// Write a JSON snapshot of every counter to `path`.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| TilepipeError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        tracing::info!("Wrote stats snapshot to {}", path.display());
        Ok(())
    }
}

/// Point-in-time copy of one stage's counters.
#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub name: String,
    pub threads: usize,
    pub threads_alive: usize,
    pub items_in: u64,
    pub items_out: u64,
    pub failures: u64,
}

/// Point-in-time copy of one channel's counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub capacity: usize,
    pub batch_size: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub occupancy: u64,
    pub blocked_puts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub stages: Vec<StageSnapshot>,
    pub queues: Vec<QueueSnapshot>,
}

impl StatsSnapshot {
    pub fn stage(&self, name: &str) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSnapshot> {
        self.queues.iter().find(|q| q.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_registration_is_shared() {
        let stats = Stats::new();
        stats.stage("read").add_items_out(5);
        stats.stage("read").add_items_out(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.stages.len(), 1);
        assert_eq!(snapshot.stage("read").unwrap().items_out, 7);
    }

    #[test]
    fn test_queue_occupancy() {
        let stats = Stats::new();
        let queue = stats.queue("features", 100, 10);
        queue.add_enqueued(30);
        queue.add_dequeued(12);
        assert_eq!(queue.occupancy(), 18);

        let snapshot = stats.snapshot();
        let q = snapshot.queue("features").unwrap();
        assert_eq!(q.capacity, 100);
        assert_eq!(q.batch_size, 10);
        assert_eq!(q.occupancy, 18);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Stats::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.stage("sink").add_items_in(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.stage("sink").items_in(), 8000);
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let stats = Stats::new();
        stats.stage("merge").add_failure();
        stats.write_json(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["stages"][0]["name"], "merge");
        assert_eq!(value["stages"][0]["failures"], 1);
    }
}
