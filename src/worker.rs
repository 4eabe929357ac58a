//! A single worker thread and its run loop.
//!
//! A worker pulls from at most one input channel, runs its stage, and pushes results
//! to at most one output channel. It is steered by two flags:
//!
//! - **stop**: exit at the next poll boundary, even with work still queued
//! - **expire**: exit once the input channel is observed empty
//!
//! A failing stage is never retried. The worker reports the error once over its
//! private error channel and exits; the pipeline picks the report up on its next poll.

use crate::channel::{Channel, ChannelId};
use crate::error::{CardinalityError, PipelineError, Result, StageError, StagePanic};
use crate::metrics::PoolMetrics;
use crate::stage::{Emitter, Role, Stage};
use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Builds one stage instance per worker, called inside the worker thread with the
/// worker's index in its pool
pub type StageFactory<I, O> =
    Arc<dyn Fn(usize) -> Box<dyn Stage<Input = I, Output = O>> + Send + Sync>;

/// Identity of a worker: owning pool name plus index within the pool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pool: Arc<str>,
    index: usize,
}

impl WorkerId {
    pub fn new(pool: Arc<str>, index: usize) -> Self {
        Self { pool, index }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pool, self.index)
    }
}

/// Control flags shared between a worker handle and its thread
#[derive(Debug, Default)]
pub(crate) struct Control {
    stop: AtomicBool,
    expire: AtomicBool,
}

impl Control {
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn expire(&self) {
        self.expire.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expire.load(Ordering::Acquire)
    }
}

/// A failure captured at the worker boundary
#[derive(Debug)]
pub struct StageFailure {
    pub worker: WorkerId,
    pub error: StageError,
    /// Backtrace of the worker at capture time; empty unless `RUST_BACKTRACE` is set
    pub trace: String,
}

/// Lifecycle of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Built,
    Running,
    /// Thread joined
    Exited,
    /// Join handle dropped after the grace period ran out
    Abandoned,
}

pub struct StageWorker<I, O> {
    id: WorkerId,
    role: Role,
    factory: StageFactory<I, O>,
    input: Option<Channel<I>>,
    output: Option<Channel<O>>,
    poll: Duration,
    metrics: PoolMetrics,
    control: Arc<Control>,
    reporter: Sender<StageFailure>,
    reports: Receiver<StageFailure>,
    captured: Option<StageFailure>,
    handle: Option<JoinHandle<()>>,
    status: WorkerStatus,
}

impl<I: Send + 'static, O: Send + 'static> StageWorker<I, O> {
    pub fn new(
        id: WorkerId,
        role: Role,
        factory: StageFactory<I, O>,
        poll: Duration,
        metrics: PoolMetrics,
    ) -> Self {
        let (reporter, reports) = channel::bounded(1);
        Self {
            id,
            role,
            factory,
            input: None,
            output: None,
            poll,
            metrics,
            control: Arc::new(Control::default()),
            reporter,
            reports,
            captured: None,
            handle: None,
            status: WorkerStatus::Built,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn set_input(&mut self, channel: Option<Channel<I>>) {
        self.input = channel;
    }

    pub fn set_output(&mut self, channel: Option<Channel<O>>) {
        self.output = channel;
    }

    pub fn input_channel(&self) -> Option<ChannelId> {
        self.input.as_ref().map(Channel::id)
    }

    pub fn output_channel(&self) -> Option<ChannelId> {
        self.output.as_ref().map(Channel::id)
    }

    /// Spawn the worker thread. A worker runs at most once.
    pub fn start(&mut self) -> Result<()> {
        if self.status != WorkerStatus::Built {
            return Err(PipelineError::AlreadyStarted(self.id.clone()));
        }
        let input = self.input.clone().ok_or_else(|| {
            PipelineError::config(format!("worker `{}` has no input channel", self.id))
        })?;

        let run = WorkerLoop {
            id: self.id.clone(),
            role: self.role,
            factory: Arc::clone(&self.factory),
            input,
            output: self.output.clone(),
            poll: self.poll,
            metrics: self.metrics.clone(),
            control: Arc::clone(&self.control),
            reporter: self.reporter.clone(),
        };
        let handle = thread::Builder::new()
            .name(self.id.to_string())
            .spawn(move || run.run())?;

        self.handle = Some(handle);
        self.status = WorkerStatus::Running;
        Ok(())
    }

    /// Exit at the next poll boundary
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Exit once the input channel is observed empty
    pub fn expire(&self) {
        self.control.expire();
    }

    pub fn is_alive(&self) -> bool {
        self.status == WorkerStatus::Running
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// True once the thread has finished, been joined or been abandoned
    pub fn has_exited(&self) -> bool {
        match self.status {
            WorkerStatus::Built => false,
            WorkerStatus::Running => !self.is_alive(),
            WorkerStatus::Exited | WorkerStatus::Abandoned => true,
        }
    }

    /// Block until the thread exits
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.id, "worker thread panicked outside its stage");
            }
            self.status = WorkerStatus::Exited;
        }
    }

    /// Wait up to `grace` for the thread to exit. Returns whether it did.
    pub fn join_timeout(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let nap = self.poll.min(Duration::from_millis(5));
        while self.is_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(nap);
        }
        self.join();
        true
    }

    /// Last-resort teardown.
    ///
    /// Threads cannot be killed, so a worker still busy inside its stage is flagged to
    /// stop and its handle is dropped; the thread exits on its own at the next poll
    /// boundary. Returns true if the worker had to be abandoned.
    pub fn terminate(&mut self) -> bool {
        self.control.stop();
        self.control.expire();
        if self.is_alive() {
            self.handle = None;
            self.status = WorkerStatus::Abandoned;
            true
        } else {
            self.join();
            false
        }
    }

    /// Non-blocking check for a reported failure
    pub fn exception(&mut self) -> Option<&StageFailure> {
        if let Ok(failure) = self.reports.try_recv() {
            self.captured = Some(failure);
        }
        self.captured.as_ref()
    }

    /// Move the reported failure out, if any
    pub fn take_exception(&mut self) -> Option<StageFailure> {
        self.exception();
        self.captured.take()
    }
}

impl<I, O> fmt::Debug for StageWorker<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageWorker")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("status", &self.status)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stopped,
    Expired,
    Failed,
}

/// State moved into the worker thread
struct WorkerLoop<I, O> {
    id: WorkerId,
    role: Role,
    factory: StageFactory<I, O>,
    input: Channel<I>,
    output: Option<Channel<O>>,
    poll: Duration,
    metrics: PoolMetrics,
    control: Arc<Control>,
    reporter: Sender<StageFailure>,
}

impl<I: Send + 'static, O: Send + 'static> WorkerLoop<I, O> {
    fn run(self) {
        debug!(worker = %self.id, role = %self.role, "worker started");

        let index = self.id.index();
        let mut stage = match panic::catch_unwind(AssertUnwindSafe(|| (self.factory)(index))) {
            Ok(stage) => stage,
            Err(payload) => {
                self.report(Box::new(StagePanic(panic_message(payload.as_ref()))));
                return;
            }
        };

        let exit = match stage.on_start() {
            Ok(()) => self.serve(stage.as_mut()),
            Err(e) => {
                self.report(e);
                Exit::Failed
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| stage.on_shutdown())).is_err() {
            error!(worker = %self.id, "stage panicked during shutdown");
        }
        debug!(worker = %self.id, ?exit, "worker exited");
    }

    fn serve(&self, stage: &mut dyn Stage<Input = I, Output = O>) -> Exit {
        while !self.control.is_stopped() {
            let Some(item) = self.input.get_timeout(self.poll) else {
                if self.control.is_expired() {
                    return Exit::Expired;
                }
                continue;
            };

            let started = Instant::now();
            let mut out =
                Emitter::new(self.output.as_ref(), &self.control, self.poll, &self.metrics);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| stage.process(item, &mut out)));
            let emitted = out.emitted();

            match outcome {
                Ok(Ok(())) if self.role == Role::Transform && emitted != 1 => {
                    self.report(Box::new(CardinalityError(emitted)));
                    return Exit::Failed;
                }
                Ok(Ok(())) => self.metrics.record_processed(started.elapsed()),
                // Interrupted mid-emit by a hard stop
                Ok(Err(_)) if self.control.is_stopped() => return Exit::Stopped,
                Ok(Err(e)) => {
                    self.report(e);
                    return Exit::Failed;
                }
                Err(payload) => {
                    self.report(Box::new(StagePanic(panic_message(payload.as_ref()))));
                    return Exit::Failed;
                }
            }
        }
        Exit::Stopped
    }

    fn report(&self, error: StageError) {
        self.metrics.record_failure();
        error!(worker = %self.id, %error, "stage failed, worker exiting");
        let failure = StageFailure {
            worker: self.id.clone(),
            error,
            trace: Backtrace::capture().to_string(),
        };
        // One report per worker lifetime; capacity 1 is enough.
        let _ = self.reporter.try_send(failure);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
