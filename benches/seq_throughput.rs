//! Segment Event Queue throughput benchmark
//!
//! Benchmarks the critical path: enqueue -> dispatch -> release. This is
//! the core scheduling performance metric for the synchronous queue, with
//! no async runtime involved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use seq_core::prelude::*;

fn new_queue() -> SegmentEventQueue {
    let params = Arc::new(StaticWorkflowParams::new());
    let options = Arc::new(StaticSystemOptions::new());
    SegmentEventQueue::new(params, options)
}

/// Single-threaded primary enqueue -> dispatch, no contention.
fn bench_primary_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("seq/primary_single");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1, 64, 256] {
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &batch_size| {
            b.iter_custom(|iters| {
                let seq = new_queue();
                let total = iters * batch_size as u64;

                let start = Instant::now();
                for i in 0..total {
                    seq.queue_primary_event(OrderId(i as i64), Priority((i % 8) as i32), None, None);
                }
                let conn = ConnectionId(1);
                for _ in 0..total {
                    seq.get_primary_event(conn).unwrap();
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Multiple workers pulling from the same primary queue concurrently.
fn bench_primary_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("seq/primary_concurrent");
    group.sample_size(20);

    for workers in [2, 4, 8] {
        let order_count = 5000u64;
        group.throughput(Throughput::Elements(order_count));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.iter(|| {
                let seq = Arc::new(new_queue());
                for i in 0..order_count {
                    seq.queue_primary_event(OrderId(i as i64), Priority((i % 8) as i32), None, None);
                }

                let claimed = Arc::new(AtomicU64::new(0));
                let mut handles = Vec::new();
                for worker_id in 0..workers {
                    let seq = Arc::clone(&seq);
                    let claimed = Arc::clone(&claimed);
                    handles.push(thread::spawn(move || {
                        let conn = ConnectionId(worker_id as u64 + 1);
                        loop {
                            if claimed.load(Ordering::Relaxed) >= order_count {
                                break;
                            }
                            match seq.get_primary_event(conn) {
                                Some(_) => {
                                    claimed.fetch_add(1, Ordering::Relaxed);
                                }
                                None => break,
                            }
                        }
                    }));
                }
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Segment claim -> release round trip under the exclusion map.
fn bench_segment_claim_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("seq/segment_claim_release");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_order", |b| {
        b.iter_custom(|iters| {
            let mut seq = new_queue();
            let segid = SegmentId(1);
            seq.add_event_segment(segid);
            let conn = ConnectionId(1);

            let start = Instant::now();
            for i in 0..iters {
                seq.queue_workflow_event(segid, OrderId(1), Priority(1), None, i as i32);
                let event = seq.get_workflow_event(conn, segid).unwrap();
                seq.release_segment(event.order_id);
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Dynamic retry dispatch: enqueue a batch of retries, drain in delay order.
fn bench_retry_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("seq/retry_dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("dynamic_batch", |b| {
        b.iter_custom(|iters| {
            let seq = new_queue();
            let t0 = now();
            for i in 0..iters {
                seq.queue_retry_event(OrderId(i as i64), t0 - 1, None);
            }
            let conn = ConnectionId(1);

            let start = Instant::now();
            for _ in 0..iters {
                seq.get_retry_event(conn).unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_primary_single,
    bench_primary_concurrent,
    bench_segment_claim_release,
    bench_retry_dispatch,
);

criterion_main!(benches);
