use crate::channel::{ChannelPlan, DEFAULT_CAPACITY};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Engine-wide tuning, loadable from TOML.
///
/// ```toml
/// poll_interval_ms = 100
/// join_grace_ms = 5000
/// channel_capacity = 50
///
/// [stages.extract]
/// workers = 8
/// capacity = 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a worker (or the driver) waits on an empty channel before re-checking
    /// its control flags
    pub poll_interval_ms: u64,
    /// How long teardown waits for a pool to join before abandoning its workers
    pub join_grace_ms: u64,
    /// Capacity of channels without an explicit override
    pub channel_capacity: usize,
    /// Per-stage overrides keyed by stage name
    pub stages: BTreeMap<String, StageOverrides>,
}

/// Overrides for one named stage. Set values win over the builder's arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverrides {
    pub workers: Option<usize>,
    /// Capacity of the stage's output channels
    pub capacity: Option<usize>,
    /// Number of output channels
    pub channels: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            join_grace_ms: 5000,
            channel_capacity: DEFAULT_CAPACITY,
            stages: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::config("poll_interval_ms must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(PipelineError::config("channel_capacity must be positive"));
        }
        for (name, stage) in &self.stages {
            if stage.workers == Some(0) {
                return Err(PipelineError::config(format!(
                    "stage `{name}` needs at least one worker"
                )));
            }
            if stage.capacity == Some(0) || stage.channels == Some(0) {
                return Err(PipelineError::config(format!(
                    "stage `{name}` channel overrides must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_join_grace(mut self, grace: Duration) -> Self {
        self.join_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_grace(&self) -> Duration {
        Duration::from_millis(self.join_grace_ms)
    }

    pub(crate) fn default_plan(&self) -> ChannelPlan {
        ChannelPlan::new(self.channel_capacity)
    }

    pub(crate) fn workers_for(&self, stage: &str, requested: usize) -> usize {
        self.stages
            .get(stage)
            .and_then(|s| s.workers)
            .unwrap_or(requested)
    }

    pub(crate) fn apply_plan_overrides(&self, stage: &str, plan: &mut ChannelPlan) {
        if let Some(overrides) = self.stages.get(stage) {
            if let Some(capacity) = overrides.capacity {
                plan.capacity = capacity;
            }
            if let Some(count) = overrides.channels {
                plan.count = count;
            }
        }
    }
}
