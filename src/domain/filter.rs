//! Time-windowed moving average used to smooth per-beacon distance samples.

use tokio::time::{Duration, Instant};

/// Default number of samples the ring can hold.
pub const DEFAULT_CAPACITY: usize = 256;

/// Default age after which a sample no longer contributes.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    at: Instant,
}

/// Fixed-capacity ring of timestamped samples.
///
/// Samples are kept in arrival order. Eviction only ever proceeds from the
/// oldest end, so the window behaves like a FIFO bounded by age: a sample is
/// dropped once it is older than the window at read time. When the ring is
/// full new samples are discarded rather than overwriting old ones.
#[derive(Debug, Clone)]
pub struct WindowedAverage {
    ring: Vec<Option<Sample>>,
    head: usize,
    tail: usize,
    window: Duration,
}

impl WindowedAverage {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            ring: vec![None; capacity.max(1)],
            head: 0,
            tail: 0,
            window,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.add_at(value, Instant::now());
    }

    /// Append a sample stamped `at`. Returns `false` if the ring was full and
    /// the sample was dropped.
    pub fn add_at(&mut self, value: f64, at: Instant) -> bool {
        if self.len() >= self.ring.len() {
            return false;
        }
        let idx = self.head % self.ring.len();
        self.ring[idx] = Some(Sample { value, at });
        self.head += 1;
        true
    }

    pub fn average(&mut self) -> f64 {
        self.average_at(Instant::now())
    }

    /// Evict expired samples relative to `now`, then return the mean of what
    /// remains (0.0 when nothing does).
    pub fn average_at(&mut self, now: Instant) -> f64 {
        self.evict(now);
        let count = self.len();
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = (self.tail..self.head)
            .filter_map(|i| self.ring[i % self.ring.len()])
            .map(|s| s.value)
            .sum();
        sum / count as f64
    }

    pub fn len(&self) -> usize {
        self.head - self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn evict(&mut self, now: Instant) {
        while self.tail < self.head {
            let idx = self.tail % self.ring.len();
            match self.ring[idx] {
                Some(sample) if now.saturating_duration_since(sample.at) > self.window => {
                    self.ring[idx] = None;
                    self.tail += 1;
                }
                _ => break,
            }
        }
        if self.tail == self.head {
            self.head = 0;
            self.tail = 0;
        }
    }
}

impl Default for WindowedAverage {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW)
    }
}
