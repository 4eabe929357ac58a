use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use streamline::{EngineConfig, PipelineBuilder};

/// A fast supply feeding a transform that spins for a few microseconds per item
fn slow_consumer(capacity: usize) -> u64 {
    let pipeline = PipelineBuilder::from_config(
        EngineConfig::default().with_poll_interval(Duration::from_millis(1)),
    )
    .supply("producer", 1, |n: u32| Ok(0..n))
    .with_capacity(capacity)
    .transform("slow", 2, |x: u32| {
        std::thread::sleep(Duration::from_micros(50));
        Ok(black_box(x))
    })
    .build()
    .expect("Build failed");

    let mut running = pipeline.start().expect("Start failed");
    for result in running.drive(vec![1_000]).expect("Drive failed") {
        result.expect("Stage failed");
    }
    running
        .metrics()
        .into_iter()
        .find(|(name, _)| name == "producer")
        .map(|(_, snapshot)| snapshot.stalls)
        .unwrap_or(0)
}

fn benchmark_backpressure_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("backpressure_slow_consumer_1000_items");
    group.sample_size(10);
    for capacity in [1, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &cap| {
            b.iter(|| slow_consumer(cap));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_backpressure_capacity);
criterion_main!(benches);
