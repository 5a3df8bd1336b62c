//! Bounded, batched, closeable channel between two stages.
//!
//! Items travel in batches of up to `batch_size` so that the lock/wake cost
//! of the underlying crossbeam channel is paid once per batch instead of once
//! per item. Capacity is counted in items: a producer blocks while the
//! buffered items plus the ones it is handing over would exceed it, no
//! matter how they are grouped into batches.
//!
//! End of stream is explicit: [`BoundedChannel::close`] never discards
//! buffered batches. Consumers keep receiving data until the buffer is empty
//! and only then observe the terminal `None`, which is returned to every
//! later call as well.
//!
//! ```text
//!  Emitter ──► [batch][batch][batch] ──► Source
//!  (per thread    at most `capacity`     (per thread
//!   local batch)   items buffered         current batch)
//! ```

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::stats::{QueueStats, StageStats, Stats};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Type-erased control surface of a channel, used by the pipeline chain
/// which mixes channels of different item types.
pub trait ChannelControl: Send + Sync {
    fn name(&self) -> &str;

    /// Mark end of stream. Idempotent.
    fn close(&self);

    /// Wake every blocked producer and consumer. Idempotent.
    fn abort(&self);

    fn is_closed(&self) -> bool;
}

/// Fixed-capacity multi-producer/multi-consumer transfer point for one item type.
pub struct BoundedChannel<T> {
    name: String,
    capacity: usize,
    batch_size: usize,
    // Never holds more than `capacity` items: `buffered` admits them first.
    tx: Sender<Vec<T>>,
    rx: Receiver<Vec<T>>,
    buffered: Mutex<usize>,
    space: Condvar,
    closed: AtomicBool,
    // Dropping the sender disconnects `closed_rx`, which wakes every select.
    close_signal: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
    aborted: AtomicBool,
    abort_signal: Mutex<Option<Sender<()>>>,
    aborted_rx: Receiver<()>,
    stats: Arc<QueueStats>,
}

impl<T: Send> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items in batches of `batch_size`.
    ///
    /// A `batch_size` larger than `capacity` is reduced to `capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `batch_size` is zero.
    pub fn new(name: impl Into<String>, capacity: usize, batch_size: usize, stats: &Stats) -> Self {
        let name = name.into();
        assert!(capacity > 0, "channel '{name}' needs a capacity of at least 1");
        assert!(batch_size > 0, "channel '{name}' needs a batch size of at least 1");

        let batch_size = batch_size.min(capacity);
        let (tx, rx) = unbounded();
        let (close_tx, closed_rx) = bounded(0);
        let (abort_tx, aborted_rx) = bounded(0);
        let stats = stats.queue(&name, capacity, batch_size);

        Self {
            name,
            capacity,
            batch_size,
            tx,
            rx,
            buffered: Mutex::new(0),
            space: Condvar::new(),
            closed: AtomicBool::new(false),
            close_signal: Mutex::new(Some(close_tx)),
            closed_rx,
            aborted: AtomicBool::new(false),
            abort_signal: Mutex::new(Some(abort_tx)),
            aborted_rx,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of items admitted and not yet taken.
    pub fn len(&self) -> usize {
        *self.buffered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Put a single item, blocking while the channel is at capacity.
    ///
    /// Producers inside a pipeline go through an [`Emitter`] instead, which
    /// hands over whole batches.
    ///
    /// # Panics
    ///
    /// Panics if the channel has already been closed.
    pub fn put(&self, item: T) -> PipelineResult<()> {
        self.put_batch(vec![item])
    }

    /// Put a run of items, blocking while the channel is at capacity.
    ///
    /// Runs longer than `batch_size` are split, so consumers never receive
    /// more than `batch_size` items at once. Returns
    /// [`PipelineError::Interrupted`] if the channel is aborted before every
    /// item could be buffered.
    ///
    /// # Panics
    ///
    /// Panics if the channel has already been closed.
    pub fn put_batch(&self, batch: Vec<T>) -> PipelineResult<()> {
        if self.is_closed() {
            panic!("put on closed channel '{}'", self.name);
        }

        let mut rest = batch;
        while !rest.is_empty() {
            let tail = if rest.len() > self.batch_size {
                rest.split_off(self.batch_size)
            } else {
                Vec::new()
            };
            let chunk = std::mem::replace(&mut rest, tail);
            let count = chunk.len();

            self.reserve(count)?;
            if self.tx.send(chunk).is_err() {
                return Err(self.interrupted());
            }
            self.stats.add_enqueued(count as u64);
        }
        Ok(())
    }

    /// Take the next buffered batch.
    ///
    /// Blocks while the channel is empty and open. Returns `None` once the
    /// channel is closed and drained (or aborted), and keeps returning `None`
    /// on every later call.
    pub fn take_batch(&self) -> Option<Vec<T>> {
        if self.is_aborted() {
            return None;
        }
        match self.rx.try_recv() {
            Ok(batch) => return Some(self.record_take(batch)),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        select! {
            recv(self.rx) -> msg => msg.ok().map(|batch| self.record_take(batch)),
            // Producers are done once the channel is closed, so whatever is
            // still buffered is all there is.
            recv(self.closed_rx) -> _ => self.rx.try_recv().ok().map(|batch| self.record_take(batch)),
            recv(self.aborted_rx) -> _ => None,
        }
    }

    /// Mark the channel closed. Buffered items stay available to consumers.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            drop(
                self.close_signal
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(),
            );
            tracing::debug!(
                "Channel '{}' closed with {} items buffered",
                self.name,
                self.len()
            );
        }
    }

    /// Abort the channel: blocked puts fail with `Interrupted`, takes return
    /// the terminal indicator even if items are still buffered.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            drop(
                self.abort_signal
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(),
            );
            // Taking the lock orders the flag before any waiter's next check.
            let buffered = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
            self.space.notify_all();
            tracing::warn!(
                "Channel '{}' aborted, dropping {} buffered items",
                self.name,
                *buffered
            );
        }
    }

    /// Wait until `count` more items fit, then admit them.
    fn reserve(&self, count: usize) -> PipelineResult<()> {
        let mut buffered = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
        if *buffered + count > self.capacity {
            self.stats.add_blocked_put();
        }
        while *buffered + count > self.capacity && !self.is_aborted() {
            buffered = self
                .space
                .wait(buffered)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if self.is_aborted() {
            return Err(self.interrupted());
        }
        *buffered += count;
        Ok(())
    }

    fn record_take(&self, batch: Vec<T>) -> Vec<T> {
        let count = batch.len();
        {
            let mut buffered = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
            *buffered = buffered.saturating_sub(count);
        }
        self.space.notify_all();
        self.stats.add_dequeued(count as u64);
        batch
    }

    fn interrupted(&self) -> PipelineError {
        PipelineError::Interrupted {
            channel: self.name.clone(),
        }
    }
}

impl<T: Send> BoundedChannel<T> {
    /// Producer handle that fills whole batches before handing them over.
    pub fn emitter(self: &Arc<Self>) -> Emitter<T> {
        Emitter::new(self.clone(), None)
    }

    /// Consumer handle that yields items one by one.
    pub fn source(self: &Arc<Self>) -> Source<T> {
        Source::new(self.clone(), None)
    }
}

impl<T: Send> ChannelControl for BoundedChannel<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        BoundedChannel::close(self)
    }

    fn abort(&self) {
        BoundedChannel::abort(self)
    }

    fn is_closed(&self) -> bool {
        BoundedChannel::is_closed(self)
    }
}

impl<T> std::fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("batch_size", &self.batch_size)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

/// Per-thread `emit` handle handed to produce and transform bodies.
pub struct Emitter<T: Send> {
    channel: Arc<BoundedChannel<T>>,
    pending: Vec<T>,
    stage: Option<Arc<StageStats>>,
}

impl<T: Send> Emitter<T> {
    pub(crate) fn new(channel: Arc<BoundedChannel<T>>, stage: Option<Arc<StageStats>>) -> Self {
        let pending = Vec::with_capacity(channel.batch_size());
        Self {
            channel,
            pending,
            stage,
        }
    }

    /// Hand one item downstream. Blocks when a full batch has to wait for space.
    pub fn emit(&mut self, item: T) -> PipelineResult<()> {
        self.pending.push(item);
        if self.pending.len() >= self.channel.batch_size() {
            self.flush()?;
        }
        Ok(())
    }

    /// Send the partially filled batch, if any.
    pub fn flush(&mut self) -> PipelineResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.channel.batch_size()),
        );
        let count = batch.len() as u64;
        self.channel.put_batch(batch)?;
        if let Some(stage) = &self.stage {
            stage.add_items_out(count);
        }
        Ok(())
    }

    pub fn channel(&self) -> &BoundedChannel<T> {
        &self.channel
    }
}

impl<T: Send> Drop for Emitter<T> {
    fn drop(&mut self) {
        if self.pending.is_empty() || std::thread::panicking() {
            return;
        }
        if self.channel.is_closed() || self.channel.is_aborted() {
            tracing::warn!(
                "Dropping {} unflushed items for channel '{}'",
                self.pending.len(),
                self.channel.name()
            );
            return;
        }
        if let Err(e) = self.flush() {
            tracing::warn!("Failed to flush emitter on drop: {}", e);
        }
    }
}

/// Per-thread `next` handle handed to transform and sink bodies.
///
/// Iterating yields every item this thread receives; `None` is the
/// terminal indicator.
pub struct Source<T: Send> {
    channel: Arc<BoundedChannel<T>>,
    current: std::vec::IntoIter<T>,
    done: bool,
    stage: Option<Arc<StageStats>>,
}

impl<T: Send> Source<T> {
    pub(crate) fn new(channel: Arc<BoundedChannel<T>>, stage: Option<Arc<StageStats>>) -> Self {
        Self {
            channel,
            current: Vec::new().into_iter(),
            done: false,
            stage,
        }
    }

    pub fn channel(&self) -> &BoundedChannel<T> {
        &self.channel
    }
}

impl<T: Send> Iterator for Source<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            match self.channel.take_batch() {
                Some(batch) => {
                    if let Some(stage) = &self.stage {
                        stage.add_items_in(batch.len() as u64);
                    }
                    self.current = batch.into_iter();
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    fn channel(capacity: usize, batch_size: usize) -> Arc<BoundedChannel<u32>> {
        let stats = Stats::new();
        Arc::new(BoundedChannel::new("test", capacity, batch_size, &stats))
    }

    #[test]
    fn test_close_drains_buffered_items() {
        let ch = channel(10, 2);
        let mut emitter = ch.emitter();
        for i in 0..5 {
            emitter.emit(i).unwrap();
        }
        emitter.flush().unwrap();
        ch.close();

        let mut seen = Vec::new();
        while let Some(batch) = ch.take_batch() {
            assert!(batch.len() <= 2);
            seen.extend(batch);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        // Terminal is sticky
        assert!(ch.take_batch().is_none());
        assert!(ch.take_batch().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let ch = channel(4, 1);
        ch.put(7).unwrap();
        ch.close();
        ch.close();
        assert!(ch.is_closed());
        assert_eq!(ch.take_batch(), Some(vec![7]));
        assert_eq!(ch.take_batch(), None);
    }

    #[test]
    #[should_panic(expected = "put on closed channel")]
    fn test_put_after_close_panics() {
        let ch = channel(4, 1);
        ch.close();
        let _ = ch.put(1);
    }

    #[test]
    fn test_take_blocks_until_close() {
        let ch = channel(4, 1);
        let consumer = {
            let ch = ch.clone();
            thread::spawn(move || ch.take_batch())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());
        ch.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_put_blocks_when_full() {
        let ch = channel(2, 1);
        ch.put(1).unwrap();
        ch.put(2).unwrap();

        let producer = {
            let ch = ch.clone();
            thread::spawn(move || ch.put(3))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(ch.take_batch(), Some(vec![1]));
        producer.join().unwrap().unwrap();
        ch.close();

        let rest: Vec<u32> = ch.source().collect();
        assert_eq!(rest, vec![2, 3]);
    }

    #[test]
    fn test_abort_wakes_blocked_put() {
        let ch = channel(1, 1);
        ch.put(1).unwrap();
        let producer = {
            let ch = ch.clone();
            thread::spawn(move || ch.put(2))
        };
        thread::sleep(Duration::from_millis(50));
        ch.abort();
        let err = producer.join().unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted { .. }));
        assert!(ch.take_batch().is_none());
    }

    #[test]
    fn test_emitter_flushes_on_drop() {
        let ch = channel(8, 4);
        {
            let mut emitter = ch.emitter();
            emitter.emit(1).unwrap();
            emitter.emit(2).unwrap();
        }
        ch.close();
        assert_eq!(ch.take_batch(), Some(vec![1, 2]));
    }

    #[test]
    fn test_capacity_counts_items_not_batches() {
        let ch = channel(4, 4);
        for i in 0..4 {
            ch.put(i).unwrap();
        }
        assert_eq!(ch.len(), 4);

        let producer = {
            let ch = ch.clone();
            thread::spawn(move || ch.put(4))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(ch.take_batch(), Some(vec![0]));
        producer.join().unwrap().unwrap();
        assert_eq!(ch.len(), 4);
    }

    #[test]
    fn test_mixed_batches_fill_to_capacity() {
        let ch = channel(5, 2);
        ch.put_batch(vec![1, 2]).unwrap();
        ch.put(3).unwrap();
        ch.put_batch(vec![4, 5]).unwrap();
        assert_eq!(ch.len(), 5);
        assert!(!ch.is_empty());
    }

    #[test]
    fn test_long_batch_is_split_and_bounded() {
        let ch = channel(4, 2);
        let producer = {
            let ch = ch.clone();
            thread::spawn(move || ch.put_batch((0..10).collect()))
        };
        thread::sleep(Duration::from_millis(50));
        // Only two chunks fit before the consumer makes room
        assert!(!producer.is_finished());
        assert_eq!(ch.len(), 4);

        let mut seen = Vec::new();
        while seen.len() < 10 {
            let batch = ch.take_batch().unwrap();
            assert!(batch.len() <= 2);
            seen.extend(batch);
        }
        producer.join().unwrap().unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<u32>>());
        assert!(ch.is_empty());
    }

    #[test]
    fn test_batch_size_limited_to_capacity() {
        let ch = channel(3, 10);
        assert_eq!(ch.batch_size(), 3);
        ch.put_batch(vec![1, 2, 3]).unwrap();
        assert_eq!(ch.take_batch(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_abort_wakes_blocked_take() {
        let ch = channel(4, 1);
        let consumer = {
            let ch = ch.clone();
            thread::spawn(move || ch.take_batch())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        ch.abort();
        assert_eq!(consumer.join().unwrap(), None);
        // Aborted, not closed: only the abort could have woken the consumer
        assert!(!ch.is_closed());
    }

    #[test]
    fn test_same_name_channels_track_their_own_items() {
        let stats = Stats::new();
        let a = BoundedChannel::new("shared", 4, 1, &stats);
        let b = BoundedChannel::new("shared", 4, 1, &stats);
        a.put(1u32).unwrap();
        a.put(2).unwrap();
        b.put(3).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert_eq!(b.take_batch(), Some(vec![3]));
        assert!(b.is_empty());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_parallel_consumers_see_each_item_once() {
        let ch = channel(16, 3);
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let ch = ch.clone();
                thread::spawn(move || ch.source().collect::<Vec<u32>>())
            })
            .collect();

        let mut emitter = ch.emitter();
        for i in 0..1000 {
            emitter.emit(i).unwrap();
        }
        emitter.flush().unwrap();
        ch.close();

        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.join().unwrap());
        }
        assert_eq!(all.len(), 1000);
        let unique: HashSet<u32> = all.into_iter().collect();
        assert_eq!(unique.len(), 1000);
    }
}
