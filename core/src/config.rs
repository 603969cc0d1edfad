//! Circuit breaker configuration
//!
//! A [`Config`] is immutable once built. Breakers hold it behind an
//! `ArcSwap`, so changing configuration means building a new one and
//! swapping it in.

use crate::classifier::{DefaultClassifier, FailureClassifier, ResultPredicate};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Sliding window strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowType {
    /// Aggregate the last `sliding_window_size` calls
    #[default]
    CountBased,
    /// Aggregate the last `sliding_window_size` seconds
    TimeBased,
}

/// How long the circuit stays open before admitting trial calls
#[derive(Clone)]
pub enum WaitInterval {
    Fixed(Duration),
    /// Grows by `multiplier` on each consecutive opening, capped at `max`.
    /// Uses chrono-machines formula: delay * (1 - jitter + rand * jitter)
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    },
    /// Receives the number of consecutive openings (1 for the first)
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl WaitInterval {
    /// Wait duration for the `attempt`-th consecutive opening
    pub fn wait_duration(&self, attempt: u32) -> Duration {
        match self {
            WaitInterval::Fixed(wait) => *wait,
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let policy = chrono_machines::Policy {
                    max_attempts: 16,
                    base_delay_ms: saturating_millis(*initial),
                    multiplier: *multiplier,
                    max_delay_ms: saturating_millis(*max),
                };
                // Past 16 doublings every sane policy sits at its cap
                let attempt = attempt.clamp(1, 16);
                Duration::from_millis(policy.calculate_delay(attempt as _, *jitter))
            }
            WaitInterval::Custom(f) => f(attempt),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            WaitInterval::Fixed(wait) if wait.is_zero() => Err(ConfigError::WaitDurationInOpenState),
            WaitInterval::Exponential {
                initial,
                multiplier,
                jitter,
                ..
            } => {
                if initial.is_zero() {
                    Err(ConfigError::WaitDurationInOpenState)
                } else if *multiplier < 1.0 {
                    Err(ConfigError::BackoffMultiplier(*multiplier))
                } else if !(0.0..=1.0).contains(jitter) {
                    Err(ConfigError::JitterFactor(*jitter))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for WaitInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitInterval::Fixed(wait) => f.debug_tuple("Fixed").field(wait).finish(),
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            WaitInterval::Custom(_) => f.write_str("Custom(<closure>)"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Clone)]
pub struct Config {
    /// Failure rate (percent) at or above which the circuit opens
    pub failure_rate_threshold: f32,

    /// Slow call rate (percent) at or above which the circuit opens
    pub slow_call_rate_threshold: f32,

    /// Calls taking longer than this are slow, even when they succeed
    pub slow_call_duration_threshold: Duration,

    pub sliding_window_type: SlidingWindowType,

    /// Calls (count based) or seconds (time based) aggregated by the window
    pub sliding_window_size: u32,

    /// Calls required before rates are evaluated
    pub minimum_number_of_calls: u32,

    /// Trial budget while half-open
    pub permitted_number_of_calls_in_half_open_state: u32,

    /// Force the circuit back open if the half-open trial runs longer than this
    pub max_wait_duration_in_half_open_state: Option<Duration>,

    pub wait_interval_in_open_state: WaitInterval,

    /// Drive Open -> HalfOpen from a timer thread instead of the next permission check
    pub automatic_transition_from_open_to_half_open_enabled: bool,

    pub failure_classifier: Arc<dyn FailureClassifier>,

    /// Marks a successful result as a failure
    pub record_result: Option<ResultPredicate>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Start a builder from an existing configuration
    pub fn to_builder(&self) -> ConfigBuilder {
        ConfigBuilder {
            config: self.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::FailureRateThreshold(self.failure_rate_threshold));
        }
        if !(self.slow_call_rate_threshold > 0.0 && self.slow_call_rate_threshold <= 100.0) {
            return Err(ConfigError::SlowCallRateThreshold(
                self.slow_call_rate_threshold,
            ));
        }
        if self.slow_call_duration_threshold.is_zero() {
            return Err(ConfigError::SlowCallDurationThreshold);
        }
        if self.sliding_window_size == 0 {
            return Err(ConfigError::SlidingWindowSize);
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::MinimumNumberOfCalls);
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::PermittedCallsInHalfOpenState);
        }
        self.wait_interval_in_open_state.validate()
    }

    /// Minimum calls a window must hold before its rates count.
    /// A count-based window can never hold more calls than its size.
    pub(crate) fn effective_minimum_calls(&self) -> u32 {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => self
                .minimum_number_of_calls
                .min(self.sliding_window_size),
            SlidingWindowType::TimeBased => self.minimum_number_of_calls,
        }
    }

    pub(crate) fn is_failure_result(&self, result: &dyn Any) -> bool {
        self.record_result
            .as_ref()
            .is_some_and(|predicate| predicate(result))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            permitted_number_of_calls_in_half_open_state: 10,
            max_wait_duration_in_half_open_state: None,
            wait_interval_in_open_state: WaitInterval::Fixed(Duration::from_secs(60)),
            automatic_transition_from_open_to_half_open_enabled: false,
            failure_classifier: Arc::new(DefaultClassifier),
            record_result: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field(
                "slow_call_duration_threshold",
                &self.slow_call_duration_threshold,
            )
            .field("sliding_window_type", &self.sliding_window_type)
            .field("sliding_window_size", &self.sliding_window_size)
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .field(
                "permitted_number_of_calls_in_half_open_state",
                &self.permitted_number_of_calls_in_half_open_state,
            )
            .field(
                "max_wait_duration_in_half_open_state",
                &self.max_wait_duration_in_half_open_state,
            )
            .field(
                "wait_interval_in_open_state",
                &self.wait_interval_in_open_state,
            )
            .field(
                "automatic_transition_from_open_to_half_open_enabled",
                &self.automatic_transition_from_open_to_half_open_enabled,
            )
            .field("failure_classifier", &self.failure_classifier)
            .field("record_result", &self.record_result.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// Fluent builder for [`Config`], validated on [`build`](ConfigBuilder::build)
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure rate threshold in percent, (0, 100]
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Slow call rate threshold in percent, (0, 100]
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn sliding_window(mut self, window_type: SlidingWindowType, size: u32) -> Self {
        self.config.sliding_window_type = window_type;
        self.config.sliding_window_size = size;
        self
    }

    pub fn sliding_window_type(mut self, window_type: SlidingWindowType) -> Self {
        self.config.sliding_window_type = window_type;
        self
    }

    pub fn sliding_window_size(mut self, size: u32) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    pub fn max_wait_duration_in_half_open_state(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration_in_half_open_state = (!wait.is_zero()).then_some(wait);
        self
    }

    /// Fixed wait before Open -> HalfOpen
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_interval_in_open_state = WaitInterval::Fixed(wait);
        self
    }

    pub fn wait_interval_in_open_state(mut self, interval: WaitInterval) -> Self {
        self.config.wait_interval_in_open_state = interval;
        self
    }

    pub fn automatic_transition_from_open_to_half_open_enabled(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open_enabled = enabled;
        self
    }

    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.config.failure_classifier = classifier;
        self
    }

    /// Record successful results matching `predicate` as failures
    ///
    /// ```rust
    /// use tripwire::Config;
    ///
    /// let config = Config::builder()
    ///     .record_result(|result| result.downcast_ref::<u16>().is_some_and(|s| *s >= 500))
    ///     .build()
    ///     .unwrap();
    /// # let _ = config;
    /// ```
    pub fn record_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&dyn Any) -> bool + Send + Sync + 'static,
    {
        self.config.record_result = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::builder().build().expect("defaults must validate");

        assert_eq!(config.failure_rate_threshold, 50.0);
        assert_eq!(config.sliding_window_type, SlidingWindowType::CountBased);
        assert_eq!(config.sliding_window_size, 100);
        assert_eq!(config.permitted_number_of_calls_in_half_open_state, 10);
        assert!(config.max_wait_duration_in_half_open_state.is_none());
        assert!(!config.automatic_transition_from_open_to_half_open_enabled);
    }

    #[test]
    fn test_rejects_out_of_range_thresholds() {
        assert!(matches!(
            Config::builder().failure_rate_threshold(0.0).build(),
            Err(ConfigError::FailureRateThreshold(_))
        ));
        assert!(matches!(
            Config::builder().failure_rate_threshold(100.5).build(),
            Err(ConfigError::FailureRateThreshold(_))
        ));
        assert!(matches!(
            Config::builder().slow_call_rate_threshold(-1.0).build(),
            Err(ConfigError::SlowCallRateThreshold(_))
        ));
        assert!(Config::builder().failure_rate_threshold(100.0).build().is_ok());
    }

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(matches!(
            Config::builder().sliding_window_size(0).build(),
            Err(ConfigError::SlidingWindowSize)
        ));
        assert!(matches!(
            Config::builder().minimum_number_of_calls(0).build(),
            Err(ConfigError::MinimumNumberOfCalls)
        ));
        assert!(matches!(
            Config::builder()
                .permitted_number_of_calls_in_half_open_state(0)
                .build(),
            Err(ConfigError::PermittedCallsInHalfOpenState)
        ));
        assert!(matches!(
            Config::builder()
                .wait_duration_in_open_state(Duration::ZERO)
                .build(),
            Err(ConfigError::WaitDurationInOpenState)
        ));
    }

    #[test]
    fn test_effective_minimum_calls_capped_by_count_window() {
        let config = Config::builder()
            .sliding_window(SlidingWindowType::CountBased, 5)
            .minimum_number_of_calls(20)
            .build()
            .unwrap();
        assert_eq!(config.effective_minimum_calls(), 5);

        let config = config
            .to_builder()
            .sliding_window_type(SlidingWindowType::TimeBased)
            .build()
            .unwrap();
        assert_eq!(config.effective_minimum_calls(), 20);
    }

    #[test]
    fn test_zero_half_open_max_wait_means_unbounded() {
        let config = Config::builder()
            .max_wait_duration_in_half_open_state(Duration::ZERO)
            .build()
            .unwrap();
        assert!(config.max_wait_duration_in_half_open_state.is_none());
    }

    #[test]
    fn test_fixed_wait_interval() {
        let interval = WaitInterval::Fixed(Duration::from_secs(5));
        assert_eq!(interval.wait_duration(1), Duration::from_secs(5));
        assert_eq!(interval.wait_duration(7), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_wait_interval_grows_and_caps() {
        let interval = WaitInterval::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(1000),
            jitter: 0.0,
        };

        assert!(interval.wait_duration(1) >= Duration::from_millis(100));
        assert!(interval.wait_duration(2) > interval.wait_duration(1));
        assert_eq!(interval.wait_duration(30), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_jitter_stays_within_bounds() {
        let interval = WaitInterval::Exponential {
            initial: Duration::from_millis(1000),
            multiplier: 1.0,
            max: Duration::from_millis(1000),
            jitter: 0.25,
        };

        for _ in 0..50 {
            let wait = interval.wait_duration(1);
            assert!(wait >= Duration::from_millis(740), "{wait:?} below jitter floor");
            assert!(wait <= Duration::from_millis(1010), "{wait:?} above base");
        }
    }

    #[test]
    fn test_rejects_invalid_backoff() {
        let builder = Config::builder().wait_interval_in_open_state(WaitInterval::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 0.5,
            max: Duration::from_secs(1),
            jitter: 0.0,
        });
        assert!(matches!(
            builder.build(),
            Err(ConfigError::BackoffMultiplier(_))
        ));

        let builder = Config::builder().wait_interval_in_open_state(WaitInterval::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
            jitter: 1.5,
        });
        assert!(matches!(builder.build(), Err(ConfigError::JitterFactor(_))));
    }

    #[test]
    fn test_custom_wait_interval_receives_attempt() {
        let interval = WaitInterval::Custom(Arc::new(|attempt| {
            Duration::from_secs(u64::from(attempt) * 10)
        }));
        assert_eq!(interval.wait_duration(3), Duration::from_secs(30));
    }

    #[test]
    fn test_record_result_predicate() {
        let config = Config::builder()
            .record_result(|result| result.downcast_ref::<u16>().is_some_and(|s| *s >= 500))
            .build()
            .unwrap();

        assert!(config.is_failure_result(&503u16));
        assert!(!config.is_failure_result(&200u16));
        assert!(!config.is_failure_result(&"not a status"));
        assert!(!Config::default().is_failure_result(&503u16));
    }
}
