//! Sliding-window aggregation of call outcomes
//!
//! Two strategies share the [`SlidingWindow`] capability:
//! - [`CountWindow`]: one bucket per call, the last `size` calls are live
//! - [`TimeWindow`]: one bucket per second, the last `size` seconds are live
//!
//! Both keep a running `total` next to their circular bucket array. Recording
//! subtracts the evicted bucket from `total` and adds the new measurement, so a
//! snapshot is a copy of `total` and never a rescan. Eviction and addition for
//! one call happen under the same lock, which keeps `total` equal to the sum of
//! the live buckets no matter how many threads record at once.

use crate::clock::Clock;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Classified result of a single protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Counted as a call, never as a failure
    Ignored,
}

/// One aggregation unit: a single call, one second of calls, or the window total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub total_duration: Duration,
    pub number_of_calls: u32,
    pub number_of_failed_calls: u32,
    pub number_of_slow_calls: u32,
    pub number_of_slow_failed_calls: u32,
    pub number_of_ignored_calls: u32,
}

impl Bucket {
    /// Bucket holding exactly one measurement
    pub fn single(duration: Duration, outcome: Outcome, slow: bool) -> Self {
        let mut bucket = Self::default();
        bucket.record(duration, outcome, slow);
        bucket
    }

    pub fn record(&mut self, duration: Duration, outcome: Outcome, slow: bool) {
        self.total_duration += duration;
        self.number_of_calls += 1;
        if slow {
            self.number_of_slow_calls += 1;
        }
        match outcome {
            Outcome::Success => {}
            Outcome::Failure => {
                self.number_of_failed_calls += 1;
                if slow {
                    self.number_of_slow_failed_calls += 1;
                }
            }
            Outcome::Ignored => self.number_of_ignored_calls += 1,
        }
    }

    pub fn add(&mut self, other: &Bucket) {
        self.total_duration += other.total_duration;
        self.number_of_calls += other.number_of_calls;
        self.number_of_failed_calls += other.number_of_failed_calls;
        self.number_of_slow_calls += other.number_of_slow_calls;
        self.number_of_slow_failed_calls += other.number_of_slow_failed_calls;
        self.number_of_ignored_calls += other.number_of_ignored_calls;
    }

    pub fn subtract(&mut self, other: &Bucket) {
        self.total_duration = self.total_duration.saturating_sub(other.total_duration);
        self.number_of_calls = self.number_of_calls.saturating_sub(other.number_of_calls);
        self.number_of_failed_calls = self
            .number_of_failed_calls
            .saturating_sub(other.number_of_failed_calls);
        self.number_of_slow_calls = self
            .number_of_slow_calls
            .saturating_sub(other.number_of_slow_calls);
        self.number_of_slow_failed_calls = self
            .number_of_slow_failed_calls
            .saturating_sub(other.number_of_slow_failed_calls);
        self.number_of_ignored_calls = self
            .number_of_ignored_calls
            .saturating_sub(other.number_of_ignored_calls);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn number_of_successful_calls(&self) -> u32 {
        self.number_of_calls
            - self.number_of_failed_calls
            - self.number_of_ignored_calls
    }
}

/// Bounded aggregator of recent call outcomes
pub trait SlidingWindow: Send + Sync + std::fmt::Debug {
    /// Record one measurement and return the window total including it
    fn record(&self, duration: Duration, outcome: Outcome, slow: bool) -> Bucket;

    /// Current window total
    fn snapshot(&self) -> Bucket;

    /// Drop every measurement
    fn clear(&self);

    /// Number of buckets (calls or seconds)
    fn size(&self) -> u32;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Bucket arithmetic cannot panic halfway through an update
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct CountRing {
    buckets: Vec<Bucket>,
    head: usize,
    total: Bucket,
}

/// Window over the last `size` calls
#[derive(Debug)]
pub struct CountWindow {
    ring: Mutex<CountRing>,
    size: u32,
}

impl CountWindow {
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            ring: Mutex::new(CountRing {
                buckets: vec![Bucket::default(); size as usize],
                head: 0,
                total: Bucket::default(),
            }),
            size,
        }
    }
}

impl SlidingWindow for CountWindow {
    fn record(&self, duration: Duration, outcome: Outcome, slow: bool) -> Bucket {
        let mut ring = lock(&self.ring);
        let next = (ring.head + 1) % ring.buckets.len();
        ring.head = next;

        let evicted = ring.buckets[next];
        let fresh = Bucket::single(duration, outcome, slow);
        ring.total.subtract(&evicted);
        ring.total.add(&fresh);
        ring.buckets[next] = fresh;

        ring.total
    }

    fn snapshot(&self) -> Bucket {
        lock(&self.ring).total
    }

    fn clear(&self) {
        let mut ring = lock(&self.ring);
        ring.buckets.iter_mut().for_each(Bucket::reset);
        ring.head = 0;
        ring.total.reset();
    }

    fn size(&self) -> u32 {
        self.size
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SecondBucket {
    epoch_second: u64,
    bucket: Bucket,
}

/// Ring of one-second buckets. The bucket `k` slots behind `head` always
/// stands for second `head.epoch_second - k`.
#[derive(Debug)]
struct TimeRing {
    buckets: Vec<SecondBucket>,
    head: usize,
    total: Bucket,
}

impl TimeRing {
    fn new(size: u32, now_second: u64) -> Self {
        let mut buckets = vec![SecondBucket::default(); size as usize];
        buckets[0].epoch_second = now_second;
        Self {
            buckets,
            head: 0,
            total: Bucket::default(),
        }
    }

    /// Evict every second that fell out of the window, even across idle gaps
    fn advance_to(&mut self, now_second: u64) {
        let head_second = self.buckets[self.head].epoch_second;
        if now_second <= head_second {
            return;
        }

        let len = self.buckets.len();
        let steps = (now_second - head_second).min(len as u64);
        for behind in (0..steps).rev() {
            self.head = (self.head + 1) % len;
            let stale = self.buckets[self.head].bucket;
            self.total.subtract(&stale);
            self.buckets[self.head] = SecondBucket {
                epoch_second: now_second - behind,
                bucket: Bucket::default(),
            };
        }
    }
}

/// Window over the last `size` seconds
#[derive(Debug)]
pub struct TimeWindow {
    ring: Mutex<TimeRing>,
    clock: Arc<dyn Clock>,
    size: u32,
}

impl TimeWindow {
    pub fn new(size: u32, clock: Arc<dyn Clock>) -> Self {
        let size = size.max(1);
        let now_second = clock.now().as_secs();
        Self {
            ring: Mutex::new(TimeRing::new(size, now_second)),
            clock,
            size,
        }
    }
}

impl SlidingWindow for TimeWindow {
    fn record(&self, duration: Duration, outcome: Outcome, slow: bool) -> Bucket {
        let mut ring = lock(&self.ring);
        // Read the clock under the lock so seconds are observed in order
        ring.advance_to(self.clock.now().as_secs());

        let head = ring.head;
        ring.buckets[head].bucket.record(duration, outcome, slow);
        ring.total.record(duration, outcome, slow);

        ring.total
    }

    fn snapshot(&self) -> Bucket {
        let mut ring = lock(&self.ring);
        ring.advance_to(self.clock.now().as_secs());
        ring.total
    }

    fn clear(&self) {
        let mut ring = lock(&self.ring);
        *ring = TimeRing::new(self.size, self.clock.now().as_secs());
    }

    fn size(&self) -> u32 {
        self.size
    }
}
