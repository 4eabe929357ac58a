use crate::channel::{Channel, ChannelIds, ChannelLoad, ChannelPlan};
use crate::config::EngineConfig;
use crate::error::{PipelineError, Result, StageError, TeardownError};
use crate::metrics::MetricsSnapshot;
use crate::pool::{ErasedChannels, Layer, WorkerPool};
use crate::stage::{MapFn, Role, SinkFn, Stage, SupplyFn, TrySupplyFn};
use crate::worker::{StageFactory, StageFailure};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Lifecycle of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Wired, no worker started
    Built,
    Running,
    /// Stopping and joining workers
    Draining,
    /// Every worker joined or abandoned
    Closed,
}

/// Builder for constructing pipelines.
///
/// `I` is the type of the work descriptors fed by [`RunningPipeline::drive`], `O` the
/// output type of the most recently added stage.
pub struct PipelineBuilder<I, O> {
    config: EngineConfig,
    head: ChannelPlan,
    layers: Vec<Box<dyn Layer>>,
    error: Option<PipelineError>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I: Send + 'static> PipelineBuilder<I, I> {
    pub fn new() -> Self {
        Self::from_config(EngineConfig::default())
    }

    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            head: config.default_plan(),
            config,
            layers: Vec::new(),
            error: None,
            _types: PhantomData,
        }
    }
}

impl<I: Send + 'static> Default for PipelineBuilder<I, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Send + 'static, O: Send + 'static> PipelineBuilder<I, O> {
    /// Add a supply stage expanding each descriptor into a finite sequence of items
    pub fn supply<T, It, F>(self, name: &str, workers: usize, supply: F) -> PipelineBuilder<I, T>
    where
        F: Fn(O) -> std::result::Result<It, StageError> + Send + Sync + 'static,
        It: IntoIterator<Item = T> + 'static,
        T: Send + 'static,
    {
        let supply = Arc::new(supply);
        self.push(name, Role::Supply, workers, move |_| {
            let supply = Arc::clone(&supply);
            SupplyFn::new(move |descriptor: O| (*supply)(descriptor))
        })
    }

    /// Add a supply stage whose sequence may fail part way through
    pub fn try_supply<T, It, F>(self, name: &str, workers: usize, supply: F) -> PipelineBuilder<I, T>
    where
        F: Fn(O) -> std::result::Result<It, StageError> + Send + Sync + 'static,
        It: IntoIterator<Item = std::result::Result<T, StageError>> + 'static,
        T: Send + 'static,
    {
        let supply = Arc::new(supply);
        self.push(name, Role::Supply, workers, move |_| {
            let supply = Arc::clone(&supply);
            TrySupplyFn::new(move |descriptor: O| (*supply)(descriptor))
        })
    }

    /// Add a supply stage built per worker by `make`
    pub fn supply_with<S, M>(self, name: &str, workers: usize, make: M) -> PipelineBuilder<I, S::Output>
    where
        M: Fn(usize) -> S + Send + Sync + 'static,
        S: Stage<Input = O> + 'static,
    {
        self.push(name, Role::Supply, workers, make)
    }

    /// Add a one-in, one-out transform stage
    pub fn transform<P, F>(self, name: &str, workers: usize, transform: F) -> PipelineBuilder<I, P>
    where
        F: Fn(O) -> std::result::Result<P, StageError> + Send + Sync + 'static,
        P: Send + 'static,
    {
        let transform = Arc::new(transform);
        self.push(name, Role::Transform, workers, move |_| {
            let transform = Arc::clone(&transform);
            MapFn::new(move |item: O| (*transform)(item))
        })
    }

    /// Add a transform stage built per worker by `make`, e.g. to give each worker its
    /// own session
    pub fn transform_with<S, M>(
        self,
        name: &str,
        workers: usize,
        make: M,
    ) -> PipelineBuilder<I, S::Output>
    where
        M: Fn(usize) -> S + Send + Sync + 'static,
        S: Stage<Input = O> + 'static,
    {
        self.push(name, Role::Transform, workers, make)
    }

    /// Add a terminal stage that swallows every item. Nothing may follow it.
    pub fn consume<F>(self, name: &str, workers: usize, consume: F) -> PipelineBuilder<I, ()>
    where
        F: Fn(O) -> std::result::Result<(), StageError> + Send + Sync + 'static,
    {
        let consume = Arc::new(consume);
        self.push(name, Role::Consume, workers, move |_| {
            let consume = Arc::clone(&consume);
            SinkFn::new(move |item: O| (*consume)(item))
        })
    }

    pub fn consume_with<S, M>(self, name: &str, workers: usize, make: M) -> PipelineBuilder<I, ()>
    where
        M: Fn(usize) -> S + Send + Sync + 'static,
        S: Stage<Input = O, Output = ()> + 'static,
    {
        self.push(name, Role::Consume, workers, make)
    }

    /// Capacity of the channels after the last added stage (before the first stage:
    /// the channels fed by the driver)
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.last_plan().capacity = capacity;
        self
    }

    /// Number of channels after the last added stage (before the first stage: the
    /// channels fed by the driver)
    pub fn with_channels(mut self, count: usize) -> Self {
        self.last_plan().count = count;
        self
    }

    fn last_plan(&mut self) -> &mut ChannelPlan {
        match self.layers.last_mut() {
            Some(layer) => layer.output_plan_mut(),
            None => &mut self.head,
        }
    }

    fn push<S, M>(mut self, name: &str, role: Role, workers: usize, make: M) -> PipelineBuilder<I, S::Output>
    where
        M: Fn(usize) -> S + Send + Sync + 'static,
        S: Stage<Input = O> + 'static,
    {
        if self.error.is_none() {
            self.error = self.check_stage_name(name);
        }

        let factory: StageFactory<O, S::Output> =
            Arc::new(move |index: usize| -> Box<dyn Stage<Input = O, Output = S::Output>> {
                Box::new(make(index))
            });
        let workers = self.config.workers_for(name, workers);
        match WorkerPool::new(name, role, workers, factory, self.config.poll_interval()) {
            Ok(pool) => self
                .layers
                .push(Box::new(pool.with_output_plan(self.config.default_plan()))),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }

        PipelineBuilder {
            config: self.config,
            head: self.head,
            layers: self.layers,
            error: self.error,
            _types: PhantomData,
        }
    }

    fn check_stage_name(&self, name: &str) -> Option<PipelineError> {
        if let Some(last) = self.layers.last().filter(|l| l.role() == Role::Consume) {
            return Some(PipelineError::config(format!(
                "stage `{name}` cannot follow consume stage `{}`",
                last.name()
            )));
        }
        if self.layers.iter().any(|l| l.name() == name) {
            return Some(PipelineError::config(format!("duplicate stage name `{name}`")));
        }
        None
    }

    /// Validate the stages and wire them together
    pub fn build(self) -> Result<Pipeline<I, O>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.config.validate()?;
        if self.layers.is_empty() {
            return Err(PipelineError::config("pipeline has no stages"));
        }

        let mut layers = self.layers;
        for layer in &mut layers {
            let name = layer.name().to_string();
            self.config.apply_plan_overrides(&name, layer.output_plan_mut());
        }

        let mut ids = ChannelIds::default();
        let (head, terminal) = wire(&mut layers, self.head, &mut ids)?;
        debug!(stages = layers.len(), channels = ?ids, "pipeline built");

        Ok(Pipeline {
            config: self.config,
            head_plan: self.head,
            layers,
            head,
            terminal,
            ids,
            state: PipelineState::Built,
        })
    }
}

/// Allocate fresh channels between every pair of adjacent pools, plus the driver-fed
/// head and the terminal channels read by the driver.
fn wire<I: Send + 'static, O: Send + 'static>(
    layers: &mut [Box<dyn Layer>],
    head_plan: ChannelPlan,
    ids: &mut ChannelIds,
) -> Result<(Vec<Channel<I>>, Vec<Channel<O>>)> {
    head_plan.validate("driver")?;
    let head: Vec<Channel<I>> = head_plan.allocate(ids);
    let mut carried: Option<ErasedChannels> = Some(Box::new(head.clone()));

    for layer in layers.iter_mut() {
        let inputs = carried.take().ok_or_else(|| {
            PipelineError::config(format!("stage `{}` follows a consume stage", layer.name()))
        })?;
        layer.accept_inputs(inputs)?;
        carried = layer.renew_outputs(ids)?;
    }

    let terminal = match carried {
        Some(channels) => *channels
            .downcast::<Vec<Channel<O>>>()
            .map_err(|_| PipelineError::config("terminal channels have the wrong item type"))?,
        None => Vec::new(),
    };
    Ok((head, terminal))
}

/// A wired pipeline whose workers have not been started
pub struct Pipeline<I, O> {
    config: EngineConfig,
    head_plan: ChannelPlan,
    layers: Vec<Box<dyn Layer>>,
    head: Vec<Channel<I>>,
    terminal: Vec<Channel<O>>,
    ids: ChannelIds,
    state: PipelineState,
}

impl<I: Send + 'static, O: Send + 'static> Pipeline<I, O> {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Channels the driver feeds
    pub fn input_channels(&self) -> &[Channel<I>] {
        &self.head
    }

    /// Channels the driver reads results from; empty when the last stage consumes
    pub fn output_channels(&self) -> &[Channel<O>] {
        &self.terminal
    }

    /// Start every pool, source first.
    ///
    /// The returned guard stops and joins every worker when dropped.
    pub fn start(mut self) -> Result<RunningPipeline<I, O>> {
        self.state = PipelineState::Running;
        let mut running = RunningPipeline { inner: self };
        for index in 0..running.inner.layers.len() {
            if let Err(e) = running.inner.layers[index].start() {
                running.teardown();
                return Err(e);
            }
        }
        info!(stages = ?running.inner.stage_names(), "pipeline started");
        Ok(running)
    }

    fn closed(config: EngineConfig) -> Self {
        Self {
            config,
            head_plan: ChannelPlan::default(),
            layers: Vec::new(),
            head: Vec::new(),
            terminal: Vec::new(),
            ids: ChannelIds::default(),
            state: PipelineState::Closed,
        }
    }

    /// Fresh workers on fresh channels, ready to start again
    fn reset(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            layer.repopulate();
        }
        let (head, terminal) = wire(&mut self.layers, self.head_plan, &mut self.ids)?;
        self.head = head;
        self.terminal = terminal;
        self.state = PipelineState::Built;
        Ok(())
    }

    /// Handles onto the channels after stage `name`, for watching a boundary from
    /// outside the pipeline. `None` for an unknown or consume stage, or for the wrong
    /// item type.
    pub fn stage_outputs<T: Send + 'static>(&self, name: &str) -> Option<Vec<Channel<T>>> {
        let layer = self.layers.iter().find(|l| l.name() == name)?;
        if layer.role() == Role::Consume {
            return None;
        }
        layer
            .output_handles()
            .downcast::<Vec<Channel<T>>>()
            .ok()
            .map(|channels| *channels)
    }

    /// Current occupancy of every channel, driver-fed channels first
    pub fn channel_loads(&self) -> Vec<ChannelLoad> {
        self.head
            .iter()
            .map(|c| c.load("driver"))
            .chain(self.layers.iter().flat_map(|l| l.output_loads()))
            .collect()
    }
}

/// A started pipeline.
///
/// Dropping it stops every pool and joins its workers, abandoning any that outlive
/// the configured grace period.
pub struct RunningPipeline<I: Send + 'static, O: Send + 'static> {
    inner: Pipeline<I, O>,
}

impl<I: Send + 'static, O: Send + 'static> RunningPipeline<I, O> {
    pub fn state(&self) -> PipelineState {
        self.inner.state
    }

    /// Feed `items` into the first stage and iterate over the results.
    ///
    /// Results arrive in completion order. A stage failure is yielded once as an
    /// `Err`, after which the pipeline is torn down and the iterator ends. Dropping
    /// the iterator early also tears the pipeline down.
    pub fn drive<'a, It>(&'a mut self, items: It) -> Result<Drive<'a, I, O>>
    where
        It: IntoIterator<Item = I>,
        It::IntoIter: 'a,
    {
        if self.inner.state != PipelineState::Running {
            return Err(PipelineError::NotRunning(self.inner.state));
        }
        Ok(Drive {
            running: self,
            pending: Box::new(items.into_iter()),
            held: None,
            feeding: true,
            next_head: 0,
            next_terminal: 0,
            finished: false,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.layers.iter().any(|l| l.is_alive())
    }

    /// Stop every pool and wait for its workers
    pub fn stop(&mut self) {
        self.teardown();
    }

    /// Tear down, then rebuild fresh workers and channels so the pipeline can be
    /// started again
    pub fn shutdown(mut self) -> Result<Pipeline<I, O>> {
        self.teardown();
        let config = self.inner.config.clone();
        let mut pipeline = std::mem::replace(&mut self.inner, Pipeline::closed(config));
        pipeline.reset()?;
        Ok(pipeline)
    }

    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.inner
            .layers
            .iter()
            .map(|l| (l.name().to_string(), l.metrics().snapshot()))
            .collect()
    }

    pub fn metrics_summary(&self) -> String {
        let mut summary = String::from("Pipeline Metrics Summary:\n");
        for (name, snapshot) in self.metrics() {
            summary.push_str(&format!("  {}: {}\n", name, snapshot.format()));
        }
        summary
    }

    /// Current occupancy of every channel, driver-fed channels first
    pub fn channel_loads(&self) -> Vec<ChannelLoad> {
        self.inner.channel_loads()
    }

    fn take_failure(&mut self) -> Option<StageFailure> {
        self.inner.layers.iter_mut().find_map(|l| l.take_exception())
    }

    /// Expire the first pool once every initial item is fed, and every later pool
    /// once the pool before it has terminated.
    fn cascade_expiry(&self, fed: bool) {
        let mut upstream_done = fed;
        for layer in &self.inner.layers {
            if !upstream_done {
                break;
            }
            layer.expire();
            upstream_done = layer.terminated();
        }
    }

    fn all_terminated(&self) -> bool {
        self.inner.layers.iter().all(|l| l.terminated())
    }

    fn teardown(&mut self) {
        if self.inner.state == PipelineState::Closed {
            return;
        }
        self.inner.state = PipelineState::Draining;

        for layer in &self.inner.layers {
            layer.stop();
        }
        let grace = self.inner.config.join_grace();
        for layer in &mut self.inner.layers {
            if !layer.join_timeout(grace) {
                for worker in layer.terminate() {
                    warn!(error = %TeardownError { worker, grace }, "forcing pool teardown");
                }
            }
        }

        let discarded = self.inner.head.iter().map(Channel::drain).sum::<usize>()
            + self.inner.layers.iter().map(|l| l.drain_outputs()).sum::<usize>();
        if discarded > 0 {
            debug!(discarded, "dropped items left queued at teardown");
        }

        self.inner.state = PipelineState::Closed;
        info!("pipeline closed");
        debug!("{}", self.metrics_summary());
    }
}

impl<I: Send + 'static, O: Send + 'static> Drop for RunningPipeline<I, O> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Iterator over the results of one [`RunningPipeline::drive`] call
pub struct Drive<'a, I: Send + 'static, O: Send + 'static> {
    running: &'a mut RunningPipeline<I, O>,
    pending: Box<dyn Iterator<Item = I> + 'a>,
    held: Option<I>,
    feeding: bool,
    next_head: usize,
    next_terminal: usize,
    finished: bool,
}

impl<'a, I: Send + 'static, O: Send + 'static> Drive<'a, I, O> {
    /// Current occupancy of every channel
    pub fn channel_loads(&self) -> Vec<ChannelLoad> {
        self.running.channel_loads()
    }

    /// Push as many initial items as fit without blocking
    fn feed(&mut self) {
        let head = &self.running.inner.head;
        while self.feeding {
            let Some(item) = self.held.take().or_else(|| self.pending.next()) else {
                self.feeding = false;
                break;
            };
            let mut item = Some(item);
            for _ in 0..head.len() {
                let slot = self.next_head % head.len();
                self.next_head += 1;
                if let Some(unplaced) = item.take() {
                    if let Err(back) = head[slot].try_put(unplaced) {
                        item = Some(back);
                    }
                }
            }
            if item.is_some() {
                self.held = item;
                break;
            }
        }
    }

    fn poll_terminal(&mut self) -> Option<O> {
        let terminal = &self.running.inner.terminal;
        let poll = self.running.inner.config.poll_interval();
        if terminal.is_empty() {
            thread::sleep(poll);
            return None;
        }
        let start = self.next_terminal;
        self.next_terminal += 1;
        (0..terminal.len())
            .find_map(|offset| terminal[(start + offset) % terminal.len()].try_get())
            .or_else(|| terminal[start % terminal.len()].get_timeout(poll))
    }

    fn terminal_empty(&self) -> bool {
        self.running.inner.terminal.iter().all(Channel::is_empty)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.running.teardown();
    }
}

impl<'a, I: Send + 'static, O: Send + 'static> Iterator for Drive<'a, I, O> {
    type Item = Result<O>;

    fn next(&mut self) -> Option<Result<O>> {
        if self.finished {
            return None;
        }
        loop {
            self.feed();
            if let Some(failure) = self.running.take_failure() {
                self.finish();
                return Some(Err(failure.into()));
            }
            if let Some(item) = self.poll_terminal() {
                return Some(Ok(item));
            }

            self.running.cascade_expiry(!self.feeding);
            if !self.feeding && self.running.all_terminated() && self.terminal_empty() {
                // A worker may have failed just before the last pool wound down.
                let failure = self.running.take_failure();
                self.finish();
                return failure.map(|f| Err(f.into()));
            }
        }
    }
}

impl<'a, I: Send + 'static, O: Send + 'static> Drop for Drive<'a, I, O> {
    fn drop(&mut self) {
        if !self.finished {
            self.running.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast() -> EngineConfig {
        EngineConfig::default().with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_pipeline_builder() {
        let pipeline = PipelineBuilder::from_config(fast())
            .supply("range", 1, |n: u32| Ok(0..n))
            .transform("square", 2, |x: u32| Ok(x * x))
            .build()
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Built);
        assert_eq!(pipeline.stage_names(), vec!["range", "square"]);
        assert_eq!(pipeline.input_channels().len(), 1);
        assert_eq!(pipeline.output_channels().len(), 1);
    }

    #[test]
    fn test_no_stages_error() {
        let result = PipelineBuilder::<u32, u32>::new().build();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_channels_are_distinct_per_boundary() {
        let pipeline = PipelineBuilder::from_config(fast())
            .with_channels(1)
            .supply("range", 2, |n: u32| Ok(0..n))
            .with_channels(2)
            .transform("id", 4, |x: u32| Ok(x))
            .build()
            .unwrap();
        let head = pipeline.input_channels()[0].id();
        let terminal = pipeline.output_channels()[0].id();
        assert_ne!(head, terminal);
        assert_eq!(pipeline.channel_loads().len(), 1 + 2 + 1);
    }

    #[test]
    fn test_stage_outputs_lookup() {
        let pipeline = PipelineBuilder::from_config(fast())
            .supply("range", 2, |n: u32| Ok(0..n))
            .with_channels(2)
            .consume("drop", 2, |_: u32| Ok(()))
            .build()
            .unwrap();
        assert_eq!(pipeline.stage_outputs::<u32>("range").map(|c| c.len()), Some(2));
        assert!(pipeline.stage_outputs::<String>("range").is_none());
        assert!(pipeline.stage_outputs::<()>("drop").is_none());
        assert!(pipeline.stage_outputs::<u32>("missing").is_none());
    }

    #[test]
    fn test_drive_requires_running() {
        let pipeline = PipelineBuilder::from_config(fast())
            .transform("id", 1, |x: u32| Ok(x))
            .build()
            .unwrap();
        let mut running = pipeline.start().unwrap();
        let got: Vec<u32> = running.drive(vec![1, 2]).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(running.state(), PipelineState::Closed);
        assert!(matches!(
            running.drive(vec![3]),
            Err(PipelineError::NotRunning(PipelineState::Closed))
        ));
    }

    #[test]
    fn test_consume_terminal_has_no_output() {
        let pipeline = PipelineBuilder::from_config(fast())
            .consume("drop", 1, |_: u32| Ok(()))
            .build()
            .unwrap();
        assert!(pipeline.output_channels().is_empty());
    }
}
