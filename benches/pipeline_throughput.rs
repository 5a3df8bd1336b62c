//! Benchmarks for channel transfer and end-to-end pipeline throughput
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tilepipe::{BoundedChannel, PipelineBuilder, Stats};

const ITEMS: u64 = 100_000;

fn bench_channel_batch_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_transfer");
    group.throughput(Throughput::Elements(ITEMS));

    for batch_size in [1usize, 16, 256].iter() {
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    let stats = Stats::new();
                    let channel = Arc::new(BoundedChannel::new("bench", 4096, batch_size, &stats));
                    let consumer = {
                        let channel = channel.clone();
                        thread::spawn(move || channel.source().fold(0u64, |acc, x| acc + x))
                    };
                    let mut emitter = channel.emitter();
                    for i in 0..ITEMS {
                        emitter.emit(black_box(i)).unwrap();
                    }
                    emitter.flush().unwrap();
                    channel.close();
                    black_box(consumer.join().unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_pipeline_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_map");
    group.throughput(Throughput::Elements(ITEMS));
    group.sample_size(20);

    for threads in [1usize, 2, 4].iter() {
        group.bench_with_input(
            BenchmarkId::new("threads", threads),
            threads,
            |b, &threads| {
                b.iter(|| {
                    let total = Arc::new(AtomicU64::new(0));
                    let sum = total.clone();
                    PipelineBuilder::new(Stats::new())
                        .read_from_iter("read", 0..ITEMS)
                        .add_buffer("input", 10_000, 100)
                        .add_worker("hash", threads, |next, emit| {
                            for x in next {
                                emit.emit(x.wrapping_mul(0x9E37_79B9_7F4A_7C15))?;
                            }
                            Ok(())
                        })
                        .add_buffer("hashed", 10_000, 100)
                        .sink_to_consumer("sum", 1, move |x| {
                            sum.fetch_add(x, Ordering::Relaxed);
                        })
                        .await_and_log(&|| {}, Duration::from_secs(60))
                        .unwrap();
                    black_box(total.load(Ordering::Relaxed))
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_channel_batch_size, bench_pipeline_threads);
criterion_main!(benches);
