use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LATENCY_WINDOW: usize = 1000;

/// Sliding window of per-item latencies
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<u64>>>,
    size: usize,
}

impl LatencyWindow {
    pub fn new(size: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(size))),
            size,
        }
    }

    /// Record a latency in nanoseconds
    pub fn record(&self, nanos: u64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.size {
            samples.pop_front();
        }
        samples.push_back(nanos);
    }

    /// Latency at quantile `q` (0.0-1.0) in microseconds, 0.0 with no samples
    pub fn quantile_us(&self, q: f64) -> f64 {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * q).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)] as f64 / 1000.0
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Counters shared by every worker of one pool.
///
/// Cloning shares the underlying counters; a repopulated pool keeps accumulating into
/// the same instance until [`PoolMetrics::reset`].
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    processed: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    stalls: Arc<AtomicU64>,
    latency: LatencyWindow,
    started: Arc<Mutex<Instant>>,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            stalls: Arc::new(AtomicU64::new(0)),
            latency: LatencyWindow::new(LATENCY_WINDOW),
            started: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// An input item was handled without error
    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed.as_nanos() as u64);
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An emit found the downstream channel full
    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn total_stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    /// Processed items per second since creation or the last reset
    pub fn throughput(&self) -> f64 {
        let elapsed = self.started.lock().elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed
        }
    }

    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.emitted.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.stalls.store(0, Ordering::Relaxed);
        self.latency.samples.lock().clear();
        *self.started.lock() = Instant::now();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.total_processed(),
            emitted: self.total_emitted(),
            failures: self.total_failures(),
            stalls: self.total_stalls(),
            throughput: self.throughput(),
            latency_p50_us: self.latency.quantile_us(0.50),
            latency_p95_us: self.latency.quantile_us(0.95),
            latency_p99_us: self.latency.quantile_us(0.99),
            elapsed: self.started.lock().elapsed(),
        }
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics of one pool at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub emitted: u64,
    pub failures: u64,
    pub stalls: u64,
    pub throughput: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn format(&self) -> String {
        format!(
            "Processed: {}, Emitted: {}, Failures: {}, Stalls: {}, Throughput: {:.2} items/s, \
             Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.processed,
            self.emitted,
            self.failures,
            self.stalls,
            self.throughput,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
