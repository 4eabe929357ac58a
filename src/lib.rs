//! A multi-stage worker-pool pipeline engine.
//!
//! Work descriptors are fanned through an ordered list of worker pools connected by
//! bounded channels, and results come back to the caller as a single lazy sequence in
//! arrival order.
//!
//! # Features
//!
//! - Supply (1 → N), Transform (1 → 1) and Consume (1 → 0) stage roles
//! - Bounded crossbeam channels: a full channel stalls its producers, nothing is dropped
//! - Many-to-many wiring between pools of different sizes without a dispatcher
//! - Worker failures (errors and panics) surface to the caller with their original type
//! - Scoped lifecycle: every worker is stopped and joined on every exit path
//! - Per-pool metrics: throughput, latency percentiles, emit stalls
//!
//! # Example
//!
//! ```no_run
//! use streamline::PipelineBuilder;
//!
//! # fn main() -> streamline::Result<()> {
//! let pipeline = PipelineBuilder::new()
//!     .supply("range", 1, |n: u32| Ok(0..n))
//!     .transform("double", 3, |x: u32| Ok(x * 2))
//!     .build()?;
//!
//! let mut running = pipeline.start()?;
//! let mut results = running
//!     .drive(vec![5])?
//!     .collect::<streamline::Result<Vec<u32>>>()?;
//! results.sort();
//! assert_eq!(results, vec![0, 2, 4, 6, 8]);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod stage;
pub mod worker;

// Re-exports for convenience
pub use channel::{Channel, ChannelId, ChannelLoad, ChannelPlan, DEFAULT_CAPACITY};
pub use config::{EngineConfig, StageOverrides};
pub use error::{CardinalityError, PipelineError, Result, StageError, StagePanic, TeardownError};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use pipeline::{Drive, Pipeline, PipelineBuilder, PipelineState, RunningPipeline};
pub use pool::{partition, Layer, WorkerPool};
pub use stage::{EmitError, Emitter, MapFn, Role, SinkFn, Stage, SupplyFn, TrySupplyFn};
pub use worker::{StageFactory, StageFailure, StageWorker, WorkerId, WorkerStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
