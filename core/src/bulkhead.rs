//! Concurrency cap in front of a breaker
//!
//! Bounds the calls running through [`CircuitBreaker::call`](crate::CircuitBreaker::call)
//! at once. A call that finds the bulkhead full never reaches the breaker, so it
//! neither takes a trial slot nor shows up in the sliding window; it is counted
//! here instead and handed to the call's fallback, if any.

use crate::errors::ConfigError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Lock-free limit on concurrent calls
#[derive(Debug)]
pub struct Bulkhead {
    max_concurrent_calls: usize,
    in_flight: AtomicUsize,
    rejected: AtomicU64,
}

impl Bulkhead {
    pub fn new(max_concurrent_calls: usize) -> Result<Self, ConfigError> {
        if max_concurrent_calls == 0 {
            return Err(ConfigError::BulkheadLimit);
        }
        Ok(Self {
            max_concurrent_calls,
            in_flight: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Enter without blocking. `None` when full; the rejection is counted.
    pub fn try_enter(self: &Arc<Self>) -> Option<BulkheadPermit> {
        let entered = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_concurrent_calls).then_some(n + 1)
            })
            .is_ok();

        if !entered {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(BulkheadPermit {
            bulkhead: Arc::clone(self),
        })
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }

    /// Calls currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.max_concurrent_calls.saturating_sub(self.in_flight())
    }

    /// Calls turned away since creation
    pub fn rejected_calls(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Slot in a [`Bulkhead`], released on drop (including unwinding)
#[derive(Debug)]
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.in_flight.fetch_sub(1, Ordering::Release);
    }
}
