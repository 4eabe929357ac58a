use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use streamline::{
    Channel, EngineConfig, Emitter, PipelineBuilder, PipelineError, PipelineState, Stage, StageError,
    StagePanic,
};
use thiserror::Error;

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_join_grace(Duration::from_secs(2))
}

#[derive(Error, Debug)]
#[error("refusing item {0}")]
struct Refused(u32);

#[test]
fn test_supply_then_transform() {
    let pipeline = PipelineBuilder::from_config(fast_config())
        .supply("range", 1, |n: u32| Ok(0..n))
        .transform("double", 3, |x: u32| Ok(x * 2))
        .build()
        .expect("Pipeline build failed");

    let mut running = pipeline.start().expect("Pipeline start failed");
    let mut results: Vec<u32> = running
        .drive(vec![5])
        .expect("Drive failed")
        .map(|r| r.expect("Stage failed"))
        .collect();
    results.sort();

    assert_eq!(results, vec![0, 2, 4, 6, 8]);
    assert_eq!(running.state(), PipelineState::Closed);
    assert!(!running.is_alive());
}

#[test]
fn test_failure_surfaces_once() {
    let pipeline = PipelineBuilder::from_config(fast_config())
        .supply("range", 1, |n: u32| Ok(0..n))
        .transform("double", 3, |x: u32| {
            if x == 3 {
                Err(Box::new(Refused(x)) as StageError)
            } else {
                Ok(x * 2)
            }
        })
        .build()
        .expect("Pipeline build failed");

    let mut running = pipeline.start().expect("Pipeline start failed");
    let started = Instant::now();
    let mut values = Vec::new();
    let mut errors = Vec::new();
    for result in running.drive(vec![5]).expect("Drive failed") {
        match result {
            Ok(v) => values.push(v),
            Err(e) => errors.push(e),
        }
    }

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(errors.len(), 1);
    let allowed: HashSet<u32> = [0, 2, 4, 8].into_iter().collect();
    assert!(values.iter().all(|v| allowed.contains(v)), "got {values:?}");

    match errors.pop() {
        Some(PipelineError::StageFailed { worker, source, .. }) => {
            assert_eq!(worker.pool(), "double");
            assert_eq!(source.downcast_ref::<Refused>().map(|r| r.0), Some(3));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    assert_eq!(running.state(), PipelineState::Closed);
    assert!(!running.is_alive());
}

#[test]
fn test_panic_surfaces_as_error() {
    let pipeline = PipelineBuilder::from_config(fast_config())
        .transform("explode", 2, |x: u32| -> Result<u32, StageError> {
            if x == 1 {
                panic!("cannot handle {x}");
            }
            Ok(x)
        })
        .build()
        .expect("Pipeline build failed");

    let mut running = pipeline.start().expect("Pipeline start failed");
    let err = running
        .drive(0..4)
        .expect("Drive failed")
        .find_map(|r| r.err())
        .expect("panic should surface");

    match err {
        PipelineError::StageFailed { source, .. } => {
            let panic = source.downcast_ref::<StagePanic>().expect("StagePanic");
            assert_eq!(panic.0, "cannot handle 1");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!running.is_alive());
}

#[test]
fn test_supply_iterator_failure() {
    let pipeline = PipelineBuilder::from_config(fast_config())
        .try_supply("records", 1, |n: u32| {
            Ok((0..n).map(move |i| -> Result<u32, StageError> {
                if i == n - 1 {
                    Err("truncated segment".into())
                } else {
                    Ok(i)
                }
            }))
        })
        .build()
        .expect("Pipeline build failed");

    let mut running = pipeline.start().expect("Pipeline start failed");
    let results: Vec<_> = running.drive(vec![4]).expect("Drive failed").collect();
    let err = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("supply failure should surface");
    assert!(err.to_string().contains("truncated segment"));
}

#[test]
fn test_channel_capacity_bounds_in_flight() {
    const CAPACITY: usize = 4;
    let pipeline = PipelineBuilder::from_config(fast_config())
        .supply("range", 1, |n: u32| Ok(0..n))
        .with_capacity(CAPACITY)
        .transform("slow", 1, |x: u32| {
            thread::sleep(Duration::from_millis(2));
            Ok(x)
        })
        .build()
        .expect("Pipeline build failed");

    // Watch the supply boundary on its own clock, independent of the driver.
    let watched: Vec<Channel<u32>> = pipeline.stage_outputs("range").expect("range outputs");
    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut peak = 0;
            while !done.load(Ordering::Acquire) {
                for channel in &watched {
                    let len = channel.len();
                    assert!(len <= CAPACITY, "{len} items pending on {}", channel.id());
                    peak = peak.max(len);
                }
                thread::sleep(Duration::from_micros(200));
            }
            peak
        })
    };

    let mut running = pipeline.start().expect("Pipeline start failed");
    let mut drive = running.drive(vec![60]).expect("Drive failed");
    let mut count = 0;
    while let Some(result) = drive.next() {
        result.expect("Stage failed");
        count += 1;
        for load in drive.channel_loads().iter().filter(|l| l.producer == "range") {
            assert!(load.len <= CAPACITY);
            assert_eq!(load.capacity, CAPACITY);
        }
    }
    drop(drive);
    done.store(true, Ordering::Release);
    let peak = sampler.join().expect("sampler panicked");

    assert_eq!(count, 60);
    assert!(peak > 0, "supply never got ahead of the slow transform");
}

struct Tracked {
    live: Arc<AtomicUsize>,
}

impl Stage for Tracked {
    type Input = u32;
    type Output = u32;

    fn process(&mut self, input: u32, out: &mut Emitter<'_, u32>) -> Result<(), StageError> {
        out.emit(input + 1)?;
        Ok(())
    }

    fn on_start(&mut self) -> Result<(), StageError> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_shutdown(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn test_clean_shutdown_leaves_no_workers() {
    let live = Arc::new(AtomicUsize::new(0));
    let shared = Arc::clone(&live);
    let pipeline = PipelineBuilder::from_config(fast_config())
        .supply("range", 2, |n: u32| Ok(0..n))
        .transform_with("increment", 4, move |_| Tracked {
            live: Arc::clone(&shared),
        })
        .build()
        .expect("Pipeline build failed");

    let mut running = pipeline.start().expect("Pipeline start failed");
    let started = Instant::now();
    let total = running
        .drive(vec![10, 20, 30])
        .expect("Drive failed")
        .map(|r| r.expect("Stage failed"))
        .count();

    assert_eq!(total, 60);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert!(!running.is_alive());
}

#[test]
fn test_fan_out_fan_in() {
    let pipeline = PipelineBuilder::from_config(fast_config())
        .with_channels(2)
        .supply("range", 2, |n: u32| Ok(0..n))
        .with_channels(2)
        .transform("square", 5, |x: u32| Ok(x * x))
        .with_channels(1)
        .build()
        .expect("Pipeline build failed");

    assert_eq!(pipeline.input_channels().len(), 2);
    assert_eq!(pipeline.output_channels().len(), 1);

    let mut running = pipeline.start().expect("Pipeline start failed");
    let mut results: Vec<u32> = running
        .drive(vec![10, 10, 10, 10])
        .expect("Drive failed")
        .map(|r| r.expect("Stage failed"))
        .collect();
    results.sort();

    let mut expected: Vec<u32> = (0..4).flat_map(|_| (0..10).map(|x| x * x)).collect();
    expected.sort();
    assert_eq!(results, expected);
}

#[test]
fn test_pipeline_reuse_after_shutdown() {
    let pipeline = PipelineBuilder::from_config(fast_config())
        .supply("range", 1, |n: u32| Ok(0..n))
        .transform("double", 2, |x: u32| Ok(x * 2))
        .build()
        .expect("Pipeline build failed");
    let first_head = pipeline.input_channels()[0].id();

    let mut running = pipeline.start().expect("Pipeline start failed");
    let first: u32 = running
        .drive(vec![4])
        .expect("Drive failed")
        .map(|r| r.expect("Stage failed"))
        .sum();

    let pipeline = running.shutdown().expect("Shutdown failed");
    assert_eq!(pipeline.state(), PipelineState::Built);
    assert_ne!(pipeline.input_channels()[0].id(), first_head);

    let mut running = pipeline.start().expect("Restart failed");
    let second: u32 = running
        .drive(vec![4])
        .expect("Drive failed")
        .map(|r| r.expect("Stage failed"))
        .sum();

    assert_eq!(first, 12);
    assert_eq!(second, 12);
}

#[test]
fn test_dropping_drive_early_tears_down() {
    let pipeline = PipelineBuilder::from_config(fast_config())
        .supply("range", 1, |n: u32| Ok(0..n))
        .with_capacity(2)
        .transform("double", 2, |x: u32| Ok(x * 2))
        .build()
        .expect("Pipeline build failed");

    let mut running = pipeline.start().expect("Pipeline start failed");
    let taken: Vec<u32> = running
        .drive(vec![10_000])
        .expect("Drive failed")
        .take(3)
        .map(|r| r.expect("Stage failed"))
        .collect();

    assert_eq!(taken.len(), 3);
    assert_eq!(running.state(), PipelineState::Closed);
    assert!(!running.is_alive());
    // Whatever was still queued is discarded at teardown.
    assert!(running.channel_loads().iter().all(|l| l.len == 0));
}

#[test]
fn test_teardown_abandons_workers_past_grace() {
    let config = fast_config().with_join_grace(Duration::from_millis(50));
    let pipeline = PipelineBuilder::from_config(config)
        .supply("range", 1, |n: u32| Ok(0..n))
        .transform("stuck", 2, |x: u32| {
            thread::sleep(Duration::from_millis(if x == 0 { 0 } else { 1_000 }));
            Ok(x)
        })
        .build()
        .expect("Pipeline build failed");

    let mut running = pipeline.start().expect("Pipeline start failed");
    let mut drive = running.drive(vec![10]).expect("Drive failed");
    let first = drive.next().map(|r| r.expect("Stage failed"));
    assert_eq!(first, Some(0));

    let started = Instant::now();
    drop(drive);
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(500), "teardown took {elapsed:?}");
    assert_eq!(running.state(), PipelineState::Closed);
    assert!(!running.is_alive());
}

#[test]
fn test_consume_terminal_pipeline() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let pipeline = PipelineBuilder::from_config(fast_config())
        .supply("range", 1, |n: u32| Ok(0..n))
        .consume("collect", 2, move |x: u32| {
            sink.lock().push(x);
            Ok(())
        })
        .build()
        .expect("Pipeline build failed");

    assert!(pipeline.output_channels().is_empty());
    let mut running = pipeline.start().expect("Pipeline start failed");
    let yielded = running.drive(vec![6]).expect("Drive failed").count();

    assert_eq!(yielded, 0);
    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);

    let metrics = running.metrics();
    assert_eq!(metrics[1].0, "collect");
    assert_eq!(metrics[1].1.processed, 6);
}

#[test]
fn test_config_overrides_stage_shape() {
    let mut config = EngineConfig::from_toml_str(
        r#"
        poll_interval_ms = 5
        join_grace_ms = 2000

        [stages.range]
        workers = 2
        channels = 2

        [stages.double]
        workers = 4
        capacity = 7
        "#,
    )
    .expect("Config parse failed");
    config.channel_capacity = 16;

    // Two output channels need two `range` workers and at least two `double` workers.
    let pipeline = PipelineBuilder::from_config(config)
        .supply("range", 1, |n: u32| Ok(0..n))
        .transform("double", 1, |x: u32| Ok(x * 2))
        .build()
        .expect("Pipeline build failed");

    assert_eq!(pipeline.input_channels()[0].capacity(), 16);
    assert_eq!(pipeline.output_channels()[0].capacity(), 7);
    let between = pipeline.stage_outputs::<u32>("range").expect("range outputs");
    assert_eq!(between.len(), 2);
    assert!(between.iter().all(|c| c.capacity() == 16));

    let mut running = pipeline.start().expect("Pipeline start failed");
    let count = running.drive(vec![8]).expect("Drive failed").count();
    assert_eq!(count, 8);
}

#[test]
fn test_invalid_pipelines_rejected() {
    let config_error = |result: Result<(), PipelineError>| {
        assert!(matches!(result, Err(PipelineError::Config(_))), "{result:?}");
    };

    config_error(PipelineBuilder::<u32, u32>::new().build().map(|_| ()));
    config_error(
        PipelineBuilder::new()
            .transform("none", 0, |x: u32| Ok(x))
            .build()
            .map(|_| ()),
    );
    config_error(
        PipelineBuilder::new()
            .supply("range", 1, |n: u32| Ok(0..n))
            .with_channels(2)
            .transform("double", 1, |x: u32| Ok(x * 2))
            .build()
            .map(|_| ()),
    );
    config_error(
        PipelineBuilder::new()
            .with_capacity(0)
            .transform("id", 1, |x: u32| Ok(x))
            .build()
            .map(|_| ()),
    );
    config_error(
        PipelineBuilder::new()
            .consume("sink", 1, |_: u32| Ok(()))
            .transform("after", 1, |x: ()| Ok(x))
            .build()
            .map(|_| ()),
    );
    config_error(
        PipelineBuilder::new()
            .transform("same", 1, |x: u32| Ok(x))
            .transform("same", 1, |x: u32| Ok(x))
            .build()
            .map(|_| ()),
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_no_items_lost(
        sizes in prop::collection::vec(0u32..20, 0..6),
        supply_workers in 1usize..3,
        transform_workers in 1usize..5,
        capacity in 1usize..8,
    ) {
        let pipeline = PipelineBuilder::from_config(fast_config())
            .supply("range", supply_workers, |n: u32| Ok(0..n))
            .with_capacity(capacity)
            .transform("triple", transform_workers, |x: u32| Ok(x * 3))
            .build()
            .expect("Pipeline build failed");

        let mut running = pipeline.start().expect("Pipeline start failed");
        let mut results: Vec<u32> = running
            .drive(sizes.clone())
            .expect("Drive failed")
            .map(|r| r.expect("Stage failed"))
            .collect();
        results.sort();

        let mut expected: Vec<u32> = sizes.iter().flat_map(|&n| (0..n).map(|x| x * 3)).collect();
        expected.sort();
        prop_assert_eq!(results, expected);
    }
}
