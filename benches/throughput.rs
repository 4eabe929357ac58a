use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use streamline::{EngineConfig, PipelineBuilder};

fn bench_config() -> EngineConfig {
    EngineConfig::default().with_poll_interval(Duration::from_millis(1))
}

fn run(supply_workers: usize, transform_workers: usize, channels: usize, items: u32) -> usize {
    let pipeline = PipelineBuilder::from_config(bench_config())
        .supply("range", supply_workers, |n: u32| Ok(0..n))
        .with_capacity(256)
        .with_channels(channels)
        .transform("hash", transform_workers, |x: u32| Ok(black_box(x).wrapping_mul(2_654_435_761)))
        .build()
        .expect("Build failed");

    let mut running = pipeline.start().expect("Start failed");
    let per_descriptor = items / supply_workers as u32;
    running
        .drive(vec![per_descriptor; supply_workers])
        .expect("Drive failed")
        .map(|r| r.expect("Stage failed"))
        .count()
}

fn benchmark_single_worker_throughput(c: &mut Criterion) {
    c.bench_function("one_to_one_10000_items", |b| {
        b.iter(|| run(1, 1, 1, 10_000));
    });
}

fn benchmark_fan_out_throughput(c: &mut Criterion) {
    c.bench_function("one_to_four_10000_items", |b| {
        b.iter(|| run(1, 4, 1, 10_000));
    });
}

fn benchmark_many_to_many_throughput(c: &mut Criterion) {
    c.bench_function("two_to_six_over_two_channels_10000_items", |b| {
        b.iter(|| run(2, 6, 2, 10_000));
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_single_worker_throughput, benchmark_fan_out_throughput, benchmark_many_to_many_throughput
);
criterion_main!(benches);
