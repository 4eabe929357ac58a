//! Homogeneous worker pools and their channel wiring.
//!
//! A pool of N workers is bound to K ≤ N input channels and K' ≤ N output channels.
//! Workers are split into contiguous groups, one group per channel, so pools of
//! different sizes can be chained without a central dispatcher.

use crate::channel::{Channel, ChannelId, ChannelIds, ChannelLoad, ChannelPlan};
use crate::error::{PipelineError, Result};
use crate::metrics::PoolMetrics;
use crate::stage::Role;
use crate::worker::{StageFactory, StageFailure, StageWorker, WorkerId};
use std::any::Any;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Channel slot for each of `workers` workers spread over `channels` channels.
///
/// Groups are contiguous, hold ⌈N/K⌉ or ⌊N/K⌋ workers, and every channel gets at
/// least one worker.
pub fn partition(workers: usize, channels: usize) -> Vec<usize> {
    (0..workers).map(|w| w * channels / workers).collect()
}

/// Channels handed from one pool to the next, with their item type erased
pub type ErasedChannels = Box<dyn Any + Send>;

/// Type-erased view of a [`WorkerPool`] used by the pipeline to drive pools whose
/// item types differ.
pub trait Layer: Send {
    fn name(&self) -> &str;
    fn role(&self) -> Role;
    fn size(&self) -> usize;

    fn start(&mut self) -> Result<()>;
    fn stop(&self);
    fn expire(&self);
    fn join(&mut self);
    fn join_timeout(&mut self, grace: Duration) -> bool;
    /// Abandon workers that are still running, returning their ids
    fn terminate(&mut self) -> Vec<WorkerId>;
    fn repopulate(&mut self);

    fn is_alive(&self) -> bool;
    fn terminated(&self) -> bool;
    fn take_exception(&mut self) -> Option<StageFailure>;

    fn metrics(&self) -> &PoolMetrics;
    fn output_plan(&self) -> ChannelPlan;
    fn output_plan_mut(&mut self) -> &mut ChannelPlan;
    fn output_loads(&self) -> Vec<ChannelLoad>;
    /// Discard whatever is still queued on the output channels
    fn drain_outputs(&self) -> usize;
    /// Handles onto the output channels, erased as `Vec<Channel<O>>`
    fn output_handles(&self) -> ErasedChannels;

    /// Bind a `Vec<Channel<I>>` produced upstream
    fn accept_inputs(&mut self, channels: ErasedChannels) -> Result<()>;
    /// Allocate fresh output channels from the output plan and bind them.
    /// Returns them erased as `Vec<Channel<O>>`, or `None` for a consume pool.
    fn renew_outputs(&mut self, ids: &mut ChannelIds) -> Result<Option<ErasedChannels>>;
}

/// A fixed-size group of workers sharing one stage factory and one role
pub struct WorkerPool<I, O> {
    name: Arc<str>,
    role: Role,
    factory: StageFactory<I, O>,
    poll: Duration,
    metrics: PoolMetrics,
    workers: Vec<StageWorker<I, O>>,
    inputs: Vec<Channel<I>>,
    outputs: Vec<Channel<O>>,
    output_plan: ChannelPlan,
}

impl<I: Send + 'static, O: Send + 'static> WorkerPool<I, O> {
    pub fn new(
        name: impl Into<String>,
        role: Role,
        size: usize,
        factory: StageFactory<I, O>,
        poll: Duration,
    ) -> Result<Self> {
        let name: Arc<str> = Arc::from(name.into());
        if size == 0 {
            return Err(PipelineError::config(format!("pool `{name}` has no workers")));
        }
        let metrics = PoolMetrics::new();
        let workers = (0..size)
            .map(|i| {
                StageWorker::new(
                    WorkerId::new(Arc::clone(&name), i),
                    role,
                    Arc::clone(&factory),
                    poll,
                    metrics.clone(),
                )
            })
            .collect();
        Ok(Self {
            name,
            role,
            factory,
            poll,
            metrics,
            workers,
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_plan: ChannelPlan::default(),
        })
    }

    pub fn with_output_plan(mut self, plan: ChannelPlan) -> Self {
        self.output_plan = plan;
        self
    }

    pub fn workers(&self) -> &[StageWorker<I, O>] {
        &self.workers
    }

    pub fn input_channels(&self) -> &[Channel<I>] {
        &self.inputs
    }

    pub fn output_channels(&self) -> &[Channel<O>] {
        &self.outputs
    }

    /// Bind `channels` as inputs, one contiguous worker group per channel
    pub fn set_input_channels(&mut self, channels: Vec<Channel<I>>) -> Result<()> {
        self.check_rewire(channels.len(), "input")?;
        let slots = partition(self.workers.len(), channels.len());
        for (worker, slot) in self.workers.iter_mut().zip(slots) {
            worker.set_input(Some(channels[slot].clone()));
        }
        self.inputs = channels;
        Ok(())
    }

    /// Bind `channels` as outputs, one contiguous worker group per channel
    pub fn set_output_channels(&mut self, channels: Vec<Channel<O>>) -> Result<()> {
        if self.role == Role::Consume {
            return Err(PipelineError::config(format!(
                "consume pool `{}` cannot have output channels",
                self.name
            )));
        }
        self.check_rewire(channels.len(), "output")?;
        let slots = partition(self.workers.len(), channels.len());
        for (worker, slot) in self.workers.iter_mut().zip(slots) {
            worker.set_output(Some(channels[slot].clone()));
        }
        self.outputs = channels;
        Ok(())
    }

    fn check_rewire(&self, count: usize, side: &str) -> Result<()> {
        if count == 0 {
            return Err(PipelineError::config(format!(
                "pool `{}` needs at least one {side} channel",
                self.name
            )));
        }
        if count > self.workers.len() {
            return Err(PipelineError::config(format!(
                "pool `{}` has {} workers but was given {count} {side} channels",
                self.name,
                self.workers.len()
            )));
        }
        if self.workers.iter().any(|w| w.is_alive()) {
            return Err(PipelineError::config(format!(
                "pool `{}` cannot be rewired while running",
                self.name
            )));
        }
        Ok(())
    }

    /// Workers reading from or writing to `channel`
    pub fn workers_on(&self, channel: ChannelId) -> Option<Range<usize>> {
        let (slot, count) = self
            .inputs
            .iter()
            .position(|c| c.id() == channel)
            .map(|slot| (slot, self.inputs.len()))
            .or_else(|| {
                self.outputs
                    .iter()
                    .position(|c| c.id() == channel)
                    .map(|slot| (slot, self.outputs.len()))
            })?;
        let slots = partition(self.workers.len(), count);
        let start = slots.iter().position(|&s| s == slot)?;
        let end = slots.iter().rposition(|&s| s == slot)? + 1;
        Some(start..end)
    }

    pub fn start(&mut self) -> Result<()> {
        self.metrics.reset();
        for worker in &mut self.workers {
            worker.start()?;
        }
        debug!(
            pool = %self.name,
            role = %self.role,
            workers = self.workers.len(),
            "pool started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.workers.iter().for_each(StageWorker::stop);
    }

    pub fn expire(&self) {
        self.workers.iter().for_each(StageWorker::expire);
    }

    pub fn join(&mut self) {
        self.workers.iter_mut().for_each(StageWorker::join);
    }

    /// Wait for every worker, sharing one `grace` deadline across the pool
    pub fn join_timeout(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut all = true;
        for worker in &mut self.workers {
            let left = deadline.saturating_duration_since(Instant::now());
            all &= worker.join_timeout(left);
        }
        all
    }

    pub fn terminate(&mut self) -> Vec<WorkerId> {
        self.workers
            .iter_mut()
            .filter_map(|w| w.terminate().then(|| w.id().clone()))
            .collect()
    }

    /// Replace every worker with a fresh one on the same wiring
    pub fn repopulate(&mut self) {
        let in_slots = partition(self.workers.len(), self.inputs.len().max(1));
        let out_slots = partition(self.workers.len(), self.outputs.len().max(1));
        self.workers = (0..self.workers.len())
            .map(|i| {
                let mut worker = StageWorker::new(
                    WorkerId::new(Arc::clone(&self.name), i),
                    self.role,
                    Arc::clone(&self.factory),
                    self.poll,
                    self.metrics.clone(),
                );
                worker.set_input(self.inputs.get(in_slots[i]).cloned());
                worker.set_output(self.outputs.get(out_slots[i]).cloned());
                worker
            })
            .collect();
        debug!(pool = %self.name, "pool repopulated");
    }

    pub fn is_alive(&self) -> bool {
        self.workers.iter().any(StageWorker::is_alive)
    }

    /// True iff every worker has an exit status
    pub fn terminated(&self) -> bool {
        self.workers.iter().all(StageWorker::has_exited)
    }

    /// First reported failure among the workers, if any
    pub fn take_exception(&mut self) -> Option<StageFailure> {
        self.workers.iter_mut().find_map(StageWorker::take_exception)
    }
}

impl<I: Send + 'static, O: Send + 'static> Layer for WorkerPool<I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        self.role
    }

    fn size(&self) -> usize {
        self.workers.len()
    }

    fn start(&mut self) -> Result<()> {
        WorkerPool::start(self)
    }

    fn stop(&self) {
        WorkerPool::stop(self)
    }

    fn expire(&self) {
        WorkerPool::expire(self)
    }

    fn join(&mut self) {
        WorkerPool::join(self)
    }

    fn join_timeout(&mut self, grace: Duration) -> bool {
        WorkerPool::join_timeout(self, grace)
    }

    fn terminate(&mut self) -> Vec<WorkerId> {
        WorkerPool::terminate(self)
    }

    fn repopulate(&mut self) {
        WorkerPool::repopulate(self)
    }

    fn is_alive(&self) -> bool {
        WorkerPool::is_alive(self)
    }

    fn terminated(&self) -> bool {
        WorkerPool::terminated(self)
    }

    fn take_exception(&mut self) -> Option<StageFailure> {
        WorkerPool::take_exception(self)
    }

    fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    fn output_plan(&self) -> ChannelPlan {
        self.output_plan
    }

    fn output_plan_mut(&mut self) -> &mut ChannelPlan {
        &mut self.output_plan
    }

    fn output_loads(&self) -> Vec<ChannelLoad> {
        self.outputs.iter().map(|c| c.load(&self.name)).collect()
    }

    fn drain_outputs(&self) -> usize {
        self.outputs.iter().map(Channel::drain).sum()
    }

    fn output_handles(&self) -> ErasedChannels {
        Box::new(self.outputs.clone())
    }

    fn accept_inputs(&mut self, channels: ErasedChannels) -> Result<()> {
        let channels = channels.downcast::<Vec<Channel<I>>>().map_err(|_| {
            PipelineError::config(format!(
                "pool `{}` was wired to channels of the wrong item type",
                self.name
            ))
        })?;
        self.set_input_channels(*channels)
    }

    fn renew_outputs(&mut self, ids: &mut ChannelIds) -> Result<Option<ErasedChannels>> {
        if self.role == Role::Consume {
            return Ok(None);
        }
        self.output_plan.validate(&self.name)?;
        let channels: Vec<Channel<O>> = self.output_plan.allocate(ids);
        self.set_output_channels(channels.clone())?;
        Ok(Some(Box::new(channels)))
    }
}
