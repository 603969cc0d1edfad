//! Point-in-time metrics derived from a sliding window

use crate::clock::Clock;
use crate::config::{Config, SlidingWindowType};
use crate::window::{Bucket, CountWindow, Outcome, SlidingWindow, TimeWindow};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Rate reported while the window holds fewer than the minimum number of calls
pub const UNRELIABLE_RATE: f32 = -1.0;

/// Snapshot of a circuit breaker's window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub number_of_calls: u32,
    pub number_of_successful_calls: u32,
    pub number_of_failed_calls: u32,
    pub number_of_ignored_calls: u32,
    pub number_of_slow_calls: u32,
    pub number_of_slow_failed_calls: u32,
    /// Calls rejected since the current state was entered
    pub number_of_not_permitted_calls: u64,
    /// Percent, or [`UNRELIABLE_RATE`] below the minimum number of calls
    pub failure_rate: f32,
    /// Percent, or [`UNRELIABLE_RATE`] below the minimum number of calls
    pub slow_call_rate: f32,
    pub total_duration: Duration,
}

impl Metrics {
    fn from_totals(totals: &Bucket, minimum_calls: u32, not_permitted: u64) -> Self {
        let calls = totals.number_of_calls;
        let (failure_rate, slow_call_rate) = if calls == 0 || calls < minimum_calls {
            (UNRELIABLE_RATE, UNRELIABLE_RATE)
        } else {
            (
                totals.number_of_failed_calls as f32 * 100.0 / calls as f32,
                totals.number_of_slow_calls as f32 * 100.0 / calls as f32,
            )
        };

        Self {
            number_of_calls: calls,
            number_of_successful_calls: totals.number_of_successful_calls(),
            number_of_failed_calls: totals.number_of_failed_calls,
            number_of_ignored_calls: totals.number_of_ignored_calls,
            number_of_slow_calls: totals.number_of_slow_calls,
            number_of_slow_failed_calls: totals.number_of_slow_failed_calls,
            number_of_not_permitted_calls: not_permitted,
            failure_rate,
            slow_call_rate,
            total_duration: totals.total_duration,
        }
    }

    pub fn number_of_slow_successful_calls(&self) -> u32 {
        self.number_of_slow_calls - self.number_of_slow_failed_calls
    }

    /// Mean call duration, zero for an empty window
    pub fn average_duration(&self) -> Duration {
        if self.number_of_calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.number_of_calls
        }
    }

    /// Whether the rates are backed by enough calls to be evaluated
    pub fn is_reliable(&self) -> bool {
        self.failure_rate != UNRELIABLE_RATE
    }
}

/// Result of comparing a snapshot against the configured thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    BelowMinimumCalls,
    BelowThresholds,
    /// Both flags can be set when both rates breach on the same call
    AboveThresholds {
        failure_rate: bool,
        slow_call_rate: bool,
    },
}

impl Verdict {
    fn evaluate(metrics: &Metrics, config: &Config) -> Self {
        if !metrics.is_reliable() {
            return Verdict::BelowMinimumCalls;
        }

        let failure_rate = metrics.failure_rate >= config.failure_rate_threshold;
        let slow_call_rate = metrics.slow_call_rate >= config.slow_call_rate_threshold;
        if failure_rate || slow_call_rate {
            Verdict::AboveThresholds {
                failure_rate,
                slow_call_rate,
            }
        } else {
            Verdict::BelowThresholds
        }
    }
}

/// Window plus rejection counter owned by a single state
#[derive(Debug)]
pub(crate) struct CircuitMetrics {
    window: Box<dyn SlidingWindow>,
    minimum_calls: u32,
    not_permitted: AtomicU64,
}

impl CircuitMetrics {
    /// Window shaped by the configured sliding window
    pub(crate) fn for_window(config: &Config, clock: &Arc<dyn Clock>) -> Self {
        let window: Box<dyn SlidingWindow> = match config.sliding_window_type {
            SlidingWindowType::CountBased => Box::new(CountWindow::new(config.sliding_window_size)),
            SlidingWindowType::TimeBased => Box::new(TimeWindow::new(
                config.sliding_window_size,
                Arc::clone(clock),
            )),
        };
        Self {
            window,
            minimum_calls: config.effective_minimum_calls(),
            not_permitted: AtomicU64::new(0),
        }
    }

    /// Fresh count window holding exactly the half-open trial
    pub(crate) fn for_trial(config: &Config) -> Self {
        let permitted = config.permitted_number_of_calls_in_half_open_state;
        Self {
            window: Box::new(CountWindow::new(permitted)),
            minimum_calls: permitted.min(config.minimum_number_of_calls),
            not_permitted: AtomicU64::new(0),
        }
    }

    /// Record one outcome and judge the resulting window in the same step
    pub(crate) fn record(
        &self,
        config: &Config,
        duration: Duration,
        outcome: Outcome,
    ) -> (Metrics, Verdict) {
        let slow = duration > config.slow_call_duration_threshold;
        let totals = self.window.record(duration, outcome, slow);
        let metrics = Metrics::from_totals(&totals, self.minimum_calls, self.not_permitted());
        (metrics, Verdict::evaluate(&metrics, config))
    }

    #[cfg(test)]
    pub(crate) fn verdict(&self, config: &Config) -> Verdict {
        Verdict::evaluate(&self.snapshot(), config)
    }

    pub(crate) fn snapshot(&self) -> Metrics {
        Metrics::from_totals(
            &self.window.snapshot(),
            self.minimum_calls,
            self.not_permitted(),
        )
    }

    pub(crate) fn on_call_not_permitted(&self) {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
    }

    fn not_permitted(&self) -> u64 {
        self.not_permitted.load(Ordering::Relaxed)
    }
}
