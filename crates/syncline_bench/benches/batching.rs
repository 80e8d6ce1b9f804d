//! Batch controller and delta benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use syncline_bench::edited_delta;
use syncline_engine::BatchController;

/// Benchmark the controller over alternating success and failure streaks.
fn bench_controller(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_controller");

    group.bench_function("grow_and_shrink", |b| {
        b.iter(|| {
            let mut batch = BatchController::new();
            for round in 0..1_000usize {
                let attempted = batch.current_size();
                batch.on_cycle_complete(black_box(attempted), round % 7 != 0);
            }
            black_box(batch.current_size());
        });
    });

    group.bench_function("capped", |b| {
        b.iter(|| {
            let mut batch = BatchController::with_ceiling(Some(64));
            for _ in 0..1_000 {
                let attempted = batch.current_size();
                batch.on_cycle_complete(black_box(attempted), true);
            }
            black_box(batch.current_size());
        });
    });

    group.finish();
}

/// Benchmark compacting repeatedly edited deltas.
fn bench_compact(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_compact");

    for edits in [1usize, 10, 100].iter() {
        let delta = edited_delta(8, *edits);
        group.throughput(Throughput::Elements(delta.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(edits), &delta, |b, delta| {
            b.iter(|| black_box(delta.compact()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_controller, bench_compact);
criterion_main!(benches);
