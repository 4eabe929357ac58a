use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of a channel between two pools
pub const DEFAULT_CAPACITY: usize = 50;

/// Identifier assigned to a channel when the pipeline is wired
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Hands out channel ids in wiring order
#[derive(Debug, Default)]
pub struct ChannelIds {
    next: u32,
}

impl ChannelIds {
    pub fn next_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next);
        self.next += 1;
        id
    }
}

/// A bounded FIFO queue between one producing pool and one consuming pool.
///
/// Cloning yields another handle onto the same queue. Every handle owns both ends, so
/// the queue never disconnects while a worker still holds it; shutdown is driven by
/// the workers' control flags instead.
pub struct Channel<T> {
    id: ChannelId,
    sender: Sender<T>,
    receiver: Receiver<T>,
    capacity: usize,
    stall_count: Arc<AtomicU64>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            capacity: self.capacity,
            stall_count: Arc::clone(&self.stall_count),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> Channel<T> {
    /// Create a channel holding at most `capacity` items.
    ///
    /// A zero capacity is rejected when the pipeline is wired, see
    /// [`ChannelPlan::validate`].
    pub fn new(id: ChannelId, capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        Self {
            id,
            sender,
            receiver,
            capacity,
            stall_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Push an item, waiting at most `timeout` for space.
    ///
    /// Gives the item back if the channel stayed full.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        match self.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => {
                self.stall_count.fetch_add(1, Ordering::Relaxed);
                self.sender.send_timeout(item, timeout).map_err(|e| match e {
                    SendTimeoutError::Timeout(item) | SendTimeoutError::Disconnected(item) => item,
                })
            }
        }
    }

    /// Push an item only if there is room right now
    pub fn try_put(&self, item: T) -> Result<(), T> {
        self.sender.try_send(item).map_err(|e| e.into_inner())
    }

    /// Pop an item, waiting at most `timeout` for one to arrive
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pop an item if one is queued
    pub fn try_get(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupancy as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.capacity.max(1)).min(100) as u32
    }

    /// Number of puts that found the channel full
    pub fn stall_count(&self) -> u64 {
        self.stall_count.load(Ordering::Relaxed)
    }

    /// Discard everything queued, returning how many items were dropped
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }

    pub(crate) fn load(&self, producer: &str) -> ChannelLoad {
        ChannelLoad {
            id: self.id,
            producer: producer.to_string(),
            len: self.len(),
            capacity: self.capacity,
        }
    }
}

/// How many channels to allocate after a stage, and how large
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPlan {
    pub count: usize,
    pub capacity: usize,
}

impl ChannelPlan {
    pub fn new(capacity: usize) -> Self {
        Self { count: 1, capacity }
    }

    pub fn validate(&self, producer: &str) -> crate::Result<()> {
        if self.count == 0 {
            return Err(crate::PipelineError::config(format!(
                "`{producer}` must feed at least one channel"
            )));
        }
        if self.capacity == 0 {
            return Err(crate::PipelineError::config(format!(
                "channels after `{producer}` need a capacity of at least 1"
            )));
        }
        Ok(())
    }

    pub fn allocate<T>(&self, ids: &mut ChannelIds) -> Vec<Channel<T>> {
        (0..self.count)
            .map(|_| Channel::new(ids.next_id(), self.capacity))
            .collect()
    }
}

impl Default for ChannelPlan {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Point-in-time occupancy of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLoad {
    pub id: ChannelId,
    /// Name of the pool (or `driver`) pushing into the channel
    pub producer: String,
    pub len: usize,
    pub capacity: usize,
}
