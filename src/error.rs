use crate::pipeline::PipelineState;
use crate::worker::{StageFailure, WorkerId};
use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type returned by stage functions.
///
/// Boxed so that the concrete error survives the trip from the worker thread back to
/// the driver and can be recovered with `downcast_ref`.
pub type StageError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the engine
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid pipeline or pool wiring, detected before anything runs
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stage function failed inside a worker
    #[error("Stage `{worker}` failed: {source}")]
    StageFailed {
        worker: WorkerId,
        #[source]
        source: StageError,
        trace: String,
    },

    /// The operation needs a running pipeline
    #[error("Pipeline is not running (state: {0:?})")]
    NotRunning(PipelineState),

    /// Workers cannot be restarted in place
    #[error("Worker `{0}` has already been started")]
    AlreadyStarted(WorkerId),

    /// Configuration file could not be read
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl PipelineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PipelineError::Config(msg.into())
    }

    /// The worker that reported this error, if it came from a stage
    pub fn worker(&self) -> Option<&WorkerId> {
        match self {
            PipelineError::StageFailed { worker, .. } | PipelineError::AlreadyStarted(worker) => {
                Some(worker)
            }
            _ => None,
        }
    }
}

impl From<StageFailure> for PipelineError {
    fn from(failure: StageFailure) -> Self {
        PipelineError::StageFailed {
            worker: failure.worker,
            source: failure.error,
            trace: failure.trace,
        }
    }
}

/// A worker that did not exit within the grace period during teardown.
///
/// Only ever logged; teardown always completes.
#[derive(Error, Debug)]
#[error("Worker `{worker}` did not exit within {grace:?}, abandoning its thread")]
pub struct TeardownError {
    pub worker: WorkerId,
    pub grace: Duration,
}

/// A stage panicked while handling an item
#[derive(Error, Debug)]
#[error("Stage panicked: {0}")]
pub struct StagePanic(pub String);

/// A stage broke its role's cardinality contract
#[derive(Error, Debug)]
#[error("Transform stage must emit exactly one item per input, emitted {0}")]
pub struct CardinalityError(pub usize);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Error, Debug)]
    #[error("bad record at offset {0}")]
    struct BadRecord(u64);

    #[test]
    fn test_stage_failure_keeps_source_type() {
        let failure = StageFailure {
            worker: WorkerId::new(Arc::from("extract"), 2),
            error: Box::new(BadRecord(42)),
            trace: String::new(),
        };
        let err = PipelineError::from(failure);

        assert_eq!(err.to_string(), "Stage `extract#2` failed: bad record at offset 42");
        assert_eq!(err.worker().map(|w| w.index()), Some(2));
        match err {
            PipelineError::StageFailed { source, .. } => {
                assert_eq!(source.downcast_ref::<BadRecord>().map(|b| b.0), Some(42));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_config_error_message() {
        let err = PipelineError::config("pool `fetch` has no workers");
        assert_eq!(err.to_string(), "Configuration error: pool `fetch` has no workers");
        assert!(err.worker().is_none());
    }
}
