//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tilepipe::{Pipeline, PipelineBuilder, Stats};

/// Progress interval short enough to exercise the tick path in tests
pub fn test_interval() -> Duration {
    Duration::from_millis(50)
}

/// Shape of a three-stage identity pipeline
#[derive(Debug, Clone, Copy)]
pub struct Shape {
    pub capacity: usize,
    pub batch_size: usize,
    pub read_threads: usize,
    pub transform_threads: usize,
    pub sink_threads: usize,
}

impl Shape {
    pub fn single(capacity: usize, batch_size: usize) -> Self {
        Self {
            capacity,
            batch_size,
            read_threads: 1,
            transform_threads: 1,
            sink_threads: 1,
        }
    }

    pub fn parallel(threads: usize) -> Self {
        Self {
            capacity: 64,
            batch_size: 8,
            read_threads: 1,
            transform_threads: threads,
            sink_threads: threads,
        }
    }
}

/// Build `read → map → collect` over `input`, returning the pipeline and the
/// shared output vector the sink appends to.
pub fn map_pipeline<F>(
    stats: Arc<Stats>,
    input: Vec<u64>,
    shape: Shape,
    f: F,
) -> (Pipeline, Arc<Mutex<Vec<u64>>>)
where
    F: Fn(u64) -> u64 + Send + Sync + 'static,
{
    let output = Arc::new(Mutex::new(Vec::with_capacity(input.len())));
    let sink = output.clone();
    let input = Arc::new(Mutex::new(input.into_iter()));

    let pipeline = PipelineBuilder::new(stats)
        .from_generator("read", shape.read_threads, move |emit| loop {
            let next = input.lock().unwrap().next();
            match next {
                Some(x) => emit.emit(x)?,
                None => return Ok(()),
            }
        })
        .add_buffer("input", shape.capacity, shape.batch_size)
        .add_worker("map", shape.transform_threads, move |next, emit| {
            for x in next {
                emit.emit(f(x))?;
            }
            Ok(())
        })
        .add_buffer("mapped", shape.capacity, shape.batch_size)
        .sink_to_consumer("collect", shape.sink_threads, move |x| {
            sink.lock().unwrap().push(x)
        });

    (pipeline, output)
}

/// Sorted copy of a shared output vector
pub fn sorted(output: &Arc<Mutex<Vec<u64>>>) -> Vec<u64> {
    let mut items = output.lock().unwrap().clone();
    items.sort_unstable();
    items
}
