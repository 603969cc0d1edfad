//! Circuit breaker facade
//!
//! Callers either drive the protocol by hand:
//!
//! ```rust
//! use tripwire::CircuitBreaker;
//! use std::time::{Duration, Instant};
//!
//! let breaker = CircuitBreaker::builder("inventory").build().unwrap();
//!
//! if breaker.try_acquire_permission() {
//!     let start = Instant::now();
//!     match "42".parse::<u32>() {
//!         Ok(_) => breaker.on_success(start.elapsed()),
//!         Err(e) => breaker.on_error(start.elapsed(), &e),
//!     }
//! }
//! ```
//!
//! or hand a closure to [`CircuitBreaker::call`], which does the same.

use crate::bulkhead::Bulkhead;
use crate::classifier::{Classification, FailureContext};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::{CallNotPermitted, CircuitError, ConfigError, RejectionReason};
use crate::events::EventPublisher;
use crate::metrics::Metrics;
use crate::state::{CircuitState, StateMachine};
use std::any::{Any, type_name};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Context provided to fallback closures when a call is rejected
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub circuit_name: String,
    /// State that rejected the call
    pub state: CircuitState,
    pub reason: RejectionReason,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(&FallbackContext) -> Result<T, E> + Send>;

/// Options for circuit breaker calls
pub struct CallOptions<T, E> {
    /// Called instead of failing when the breaker rejects the call
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Lets `call()` take either a bare closure or a `(closure, CallOptions)` pair
pub trait IntoCallOptions<T, E> {
    /// The protected operation, run in place on the caller's thread
    type Operation: FnOnce() -> Result<T, E>;

    fn into_call_options(self) -> (Self::Operation, CallOptions<T, E>);
}

impl<T, E, F> IntoCallOptions<T, E> for F
where
    F: FnOnce() -> Result<T, E>,
{
    type Operation = F;

    fn into_call_options(self) -> (F, CallOptions<T, E>) {
        (self, CallOptions::default())
    }
}

impl<T, E, F> IntoCallOptions<T, E> for (F, CallOptions<T, E>)
where
    F: FnOnce() -> Result<T, E>,
{
    type Operation = F;

    fn into_call_options(self) -> (F, CallOptions<T, E>) {
        self
    }
}

/// A named circuit breaker. Cloning shares the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    machine: Arc<StateMachine>,
    bulkhead: Option<Arc<Bulkhead>>,
}

impl CircuitBreaker {
    /// Create a circuit breaker on the system clock (use builder() for more options)
    pub fn new(name: impl Into<String>, config: Config) -> Result<Self, ConfigError> {
        Self::from_parts(name.into(), config, Arc::new(SystemClock::new()), None)
    }

    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub(crate) fn from_parts(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        bulkhead: Option<Arc<Bulkhead>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(name, Arc::new(config), clock, bulkhead))
    }

    pub(crate) fn from_validated(
        name: String,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        bulkhead: Option<Arc<Bulkhead>>,
    ) -> Self {
        Self {
            machine: StateMachine::new(Arc::from(name), config, clock),
            bulkhead,
        }
    }

    pub fn name(&self) -> &str {
        self.machine.name()
    }

    pub fn state(&self) -> CircuitState {
        self.machine.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn config(&self) -> Arc<Config> {
        self.machine.config()
    }

    /// Validate and atomically swap the configuration. Thresholds, durations
    /// and classification apply to the next call; the window shape applies
    /// from the next state transition.
    pub fn change_config(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.machine.change_config(Arc::new(config));
        Ok(())
    }

    /// Snapshot of the current state's window. Safe to poll at any rate.
    pub fn metrics(&self) -> Metrics {
        self.machine.metrics()
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        self.machine.events()
    }

    pub fn bulkhead(&self) -> Option<&Arc<Bulkhead>> {
        self.bulkhead.as_ref()
    }

    /// Admission check; `false` means rejected
    pub fn try_acquire_permission(&self) -> bool {
        self.machine.try_acquire().is_ok()
    }

    /// Admission check that reports why the call was rejected
    pub fn acquire_permission(&self) -> Result<(), CallNotPermitted> {
        self.machine.try_acquire()
    }

    /// Give back a permission for a call that never ran
    pub fn release_permission(&self) {
        self.machine.release();
    }

    /// Report a successful call
    pub fn on_success(&self, duration: Duration) {
        self.machine.on_success(&self.machine.config(), duration);
    }

    /// Report a failed call; the configured classifier decides how it counts
    pub fn on_error<E: Any>(&self, duration: Duration, error: &E) {
        self.report_error(&self.machine.config(), duration, error);
    }

    /// Report a successful call whose result may still count as a failure
    pub fn on_result<T: Any>(&self, duration: Duration, result: &T) {
        self.report_result(&self.machine.config(), duration, result);
    }

    // Classification and recording share one configuration snapshot, so a
    // concurrent change_config never splits a single outcome across two.

    fn report_error<E: Any>(&self, config: &Config, duration: Duration, error: &E) {
        let error_type = type_name::<E>();
        let classification = config.failure_classifier.classify(&FailureContext {
            circuit_name: self.name(),
            error,
            error_type,
            duration,
        });
        self.machine
            .on_error(config, duration, classification, error_type);
    }

    fn report_result<T: Any>(&self, config: &Config, duration: Duration, result: &T) {
        if config.is_failure_result(result) {
            self.machine
                .on_error(config, duration, Classification::Failure, type_name::<T>());
        } else {
            self.machine.on_success(config, duration);
        }
    }

    /// Current reading of the breaker's clock, for timing calls by hand
    pub fn current_time(&self) -> Duration {
        self.machine.clock().now()
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Accepts either:
    /// - A plain closure: `breaker.call(|| api_request())`
    /// - A closure with options: `breaker.call((|| api_request(), CallOptions::new().with_fallback(...)))`
    pub fn call<I, T: 'static, E: 'static>(&self, input: I) -> Result<T, CircuitError<E>>
    where
        I: IntoCallOptions<T, E>,
    {
        let (operation, options) = input.into_call_options();

        let _permit = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.try_enter() {
                Some(permit) => Some(permit),
                None => {
                    let max_concurrent_calls = bulkhead.max_concurrent_calls();
                    debug!(circuit = %self.name(), max_concurrent_calls, "bulkhead full");
                    let full = CircuitError::BulkheadFull {
                        circuit: self.name().to_string(),
                        limit: max_concurrent_calls,
                    };
                    return Self::fall_back(
                        options,
                        self.name(),
                        self.state(),
                        RejectionReason::BulkheadFull,
                        full,
                    );
                }
            },
            None => None,
        };

        if let Err(rejected) = self.acquire_permission() {
            let (state, reason) = (rejected.state, rejected.reason);
            return Self::fall_back(options, self.name(), state, reason, rejected.into());
        }

        let mut admitted = Admitted {
            breaker: self,
            reported: false,
        };
        let start = self.current_time();
        let result = operation();
        let duration = self.current_time().saturating_sub(start);
        admitted.reported = true;

        let config = self.machine.config();
        match result {
            Ok(value) => {
                self.report_result(&config, duration, &value);
                Ok(value)
            }
            Err(e) => {
                self.report_error(&config, duration, &e);
                Err(CircuitError::Execution(e))
            }
        }
    }

    /// Answer a rejected call from its fallback, or with `rejection` when it has none
    fn fall_back<T, E>(
        options: CallOptions<T, E>,
        circuit_name: &str,
        state: CircuitState,
        reason: RejectionReason,
        rejection: CircuitError<E>,
    ) -> Result<T, CircuitError<E>> {
        match options.fallback {
            Some(fallback) => {
                let ctx = FallbackContext {
                    circuit_name: circuit_name.to_string(),
                    state,
                    reason,
                };
                fallback(&ctx).map_err(CircuitError::Execution)
            }
            None => Err(rejection),
        }
    }

    pub fn reset(&self) {
        self.machine.reset();
    }

    pub fn transition_to_closed_state(&self) {
        self.machine.transition_to(CircuitState::Closed);
    }

    pub fn transition_to_open_state(&self) {
        self.machine.transition_to(CircuitState::Open);
    }

    pub fn transition_to_half_open_state(&self) {
        self.machine.transition_to(CircuitState::HalfOpen);
    }

    pub fn transition_to_disabled_state(&self) {
        self.machine.transition_to(CircuitState::Disabled);
    }

    pub fn transition_to_forced_open_state(&self) {
        self.machine.transition_to(CircuitState::ForcedOpen);
    }

    pub fn transition_to_metrics_only_state(&self) {
        self.machine.transition_to(CircuitState::MetricsOnly);
    }

    /// Whether two handles refer to the same breaker
    pub fn ptr_eq(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.machine, &other.machine)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("machine", &self.machine)
            .field("bulkhead", &self.bulkhead)
            .finish()
    }
}

/// Releases the permission if the protected call unwinds before reporting
struct Admitted<'a> {
    breaker: &'a CircuitBreaker,
    reported: bool,
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.release_permission();
        }
    }
}
