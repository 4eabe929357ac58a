use crate::channel::Channel;
use crate::error::StageError;
use crate::metrics::PoolMetrics;
use crate::worker::Control;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use thiserror::Error;

/// What a pool does with each item it pulls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// One descriptor in, any number of items out
    Supply,
    /// One item in, exactly one item out
    Transform,
    /// One item in, nothing out
    Consume,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Supply => "supply",
            Role::Transform => "transform",
            Role::Consume => "consume",
        };
        f.write_str(name)
    }
}

/// A processing stage run by every worker of a pool.
///
/// Each worker builds its own instance inside its own thread, so a stage may hold
/// per-worker resources (sessions, parsers, caches) without being `Send`.
pub trait Stage {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Handle one input, pushing results through `out`
    fn process(
        &mut self,
        input: Self::Input,
        out: &mut Emitter<'_, Self::Output>,
    ) -> Result<(), StageError>;

    /// Called in the worker thread before the first item
    fn on_start(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Called in the worker thread when the worker exits, whatever the reason
    fn on_shutdown(&mut self) {}
}

/// Why an emitted item did not reach the output channel
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    /// The worker was told to stop while waiting for room downstream
    #[error("worker stopped while the output channel was full")]
    Halted,
    /// The stage has no downstream channel
    #[error("consume stages have no output channel")]
    NoOutput,
}

/// Output handle passed to [`Stage::process`].
///
/// Every emit is a backpressure point: it blocks while the downstream channel is full,
/// waking once per poll interval to honour a hard stop.
pub struct Emitter<'a, T> {
    output: Option<&'a Channel<T>>,
    control: &'a Control,
    poll: Duration,
    metrics: &'a PoolMetrics,
    emitted: usize,
}

impl<'a, T> Emitter<'a, T> {
    pub(crate) fn new(
        output: Option<&'a Channel<T>>,
        control: &'a Control,
        poll: Duration,
        metrics: &'a PoolMetrics,
    ) -> Self {
        Self {
            output,
            control,
            poll,
            metrics,
            emitted: 0,
        }
    }

    pub fn emit(&mut self, item: T) -> Result<(), EmitError> {
        let channel = self.output.ok_or(EmitError::NoOutput)?;
        let mut item = item;
        let mut stalled = false;
        loop {
            match channel.put_timeout(item, self.poll) {
                Ok(()) => {
                    self.emitted += 1;
                    self.metrics.record_emitted();
                    return Ok(());
                }
                Err(back) => {
                    if !stalled {
                        self.metrics.record_stall();
                        stalled = true;
                    }
                    if self.control.is_stopped() {
                        return Err(EmitError::Halted);
                    }
                    item = back;
                }
            }
        }
    }

    /// Items emitted for the current input so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

/// Supply stage built from a closure returning an iterator
pub struct SupplyFn<F, D, It> {
    supply: F,
    _types: PhantomData<fn(D) -> It>,
}

impl<F, D, It> SupplyFn<F, D, It>
where
    F: FnMut(D) -> Result<It, StageError>,
{
    pub fn new(supply: F) -> Self {
        Self {
            supply,
            _types: PhantomData,
        }
    }
}

impl<F, D, It> Stage for SupplyFn<F, D, It>
where
    F: FnMut(D) -> Result<It, StageError>,
    D: Send + 'static,
    It: IntoIterator,
    It::Item: Send + 'static,
{
    type Input = D;
    type Output = It::Item;

    fn process(&mut self, input: D, out: &mut Emitter<'_, It::Item>) -> Result<(), StageError> {
        for item in (self.supply)(input)? {
            out.emit(item)?;
        }
        Ok(())
    }
}

/// Supply stage whose iterator can fail part way through, e.g. a truncated archive
pub struct TrySupplyFn<F, D, It> {
    supply: F,
    _types: PhantomData<fn(D) -> It>,
}

impl<F, D, It, T> TrySupplyFn<F, D, It>
where
    F: FnMut(D) -> Result<It, StageError>,
    It: IntoIterator<Item = Result<T, StageError>>,
{
    pub fn new(supply: F) -> Self {
        Self {
            supply,
            _types: PhantomData,
        }
    }
}

impl<F, D, It, T> Stage for TrySupplyFn<F, D, It>
where
    F: FnMut(D) -> Result<It, StageError>,
    D: Send + 'static,
    It: IntoIterator<Item = Result<T, StageError>>,
    T: Send + 'static,
{
    type Input = D;
    type Output = T;

    fn process(&mut self, input: D, out: &mut Emitter<'_, T>) -> Result<(), StageError> {
        for item in (self.supply)(input)? {
            out.emit(item?)?;
        }
        Ok(())
    }
}

/// Transform stage built from a closure
pub struct MapFn<F, I, O> {
    map: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<F, I, O> MapFn<F, I, O>
where
    F: FnMut(I) -> Result<O, StageError>,
{
    pub fn new(map: F) -> Self {
        Self {
            map,
            _types: PhantomData,
        }
    }
}

impl<F, I, O> Stage for MapFn<F, I, O>
where
    F: FnMut(I) -> Result<O, StageError>,
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    fn process(&mut self, input: I, out: &mut Emitter<'_, O>) -> Result<(), StageError> {
        out.emit((self.map)(input)?)?;
        Ok(())
    }
}

/// Consume stage built from a closure
pub struct SinkFn<F, I> {
    sink: F,
    _types: PhantomData<fn(I)>,
}

impl<F, I> SinkFn<F, I>
where
    F: FnMut(I) -> Result<(), StageError>,
{
    pub fn new(sink: F) -> Self {
        Self {
            sink,
            _types: PhantomData,
        }
    }
}

impl<F, I> Stage for SinkFn<F, I>
where
    F: FnMut(I) -> Result<(), StageError>,
    I: Send + 'static,
{
    type Input = I;
    type Output = ();

    fn process(&mut self, input: I, _out: &mut Emitter<'_, ()>) -> Result<(), StageError> {
        (self.sink)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;

    fn run<S: Stage>(
        stage: &mut S,
        input: S::Input,
        capacity: usize,
    ) -> (Result<(), StageError>, Vec<S::Output>) {
        let channel = Channel::new(ChannelId(0), capacity);
        let control = Control::default();
        let metrics = PoolMetrics::new();
        let mut out = Emitter::new(Some(&channel), &control, Duration::from_millis(5), &metrics);
        let result = stage.process(input, &mut out);
        let mut items = Vec::new();
        while let Some(item) = channel.try_get() {
            items.push(item);
        }
        (result, items)
    }

    #[test]
    fn test_supply_fn_emits_each_item() {
        let mut stage = SupplyFn::new(|n: u32| Ok(0..n));
        let (result, items) = run(&mut stage, 4, 10);
        assert!(result.is_ok());
        assert_eq!(items, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_try_supply_stops_at_first_bad_item() {
        let mut stage = TrySupplyFn::new(|n: u32| {
            Ok((0..n).map(|i| -> Result<u32, StageError> {
                if i == 2 {
                    Err("truncated".into())
                } else {
                    Ok(i)
                }
            }))
        });
        let (result, items) = run(&mut stage, 5, 10);
        assert_eq!(result.unwrap_err().to_string(), "truncated");
        assert_eq!(items, vec![0, 1]);
    }

    #[test]
    fn test_map_fn() {
        let mut stage = MapFn::new(|x: u64| Ok(x * 2));
        let (result, items) = run(&mut stage, 21, 1);
        assert!(result.is_ok());
        assert_eq!(items, vec![42]);
    }

    #[test]
    fn test_map_fn_error_emits_nothing() {
        let mut stage =
            MapFn::new(|x: u64| -> Result<u64, StageError> { Err(format!("bad {x}").into()) });
        let (result, items) = run(&mut stage, 3, 1);
        assert_eq!(result.unwrap_err().to_string(), "bad 3");
        assert!(items.is_empty());
    }

    #[test]
    fn test_emit_halts_on_full_channel_when_stopped() {
        let channel = Channel::new(ChannelId(0), 1);
        let control = Control::default();
        let metrics = PoolMetrics::new();
        let mut out = Emitter::new(Some(&channel), &control, Duration::from_millis(5), &metrics);
        assert!(out.emit(1).is_ok());
        control.stop();
        assert_eq!(out.emit(2), Err(EmitError::Halted));
        assert_eq!(out.emitted(), 1);
        assert_eq!(metrics.total_stalls(), 1);
    }

    #[test]
    fn test_emit_without_output() {
        let control = Control::default();
        let metrics = PoolMetrics::new();
        let mut out: Emitter<'_, u8> =
            Emitter::new(None, &control, Duration::from_millis(5), &metrics);
        assert_eq!(out.emit(1), Err(EmitError::NoOutput));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Supply.to_string(), "supply");
        assert_eq!(Role::Consume.to_string(), "consume");
    }
}
