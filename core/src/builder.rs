//! Builder API for ergonomic circuit breaker construction

use crate::{
    bulkhead::Bulkhead,
    circuit::CircuitBreaker,
    clock::{Clock, SystemClock},
    config::Config,
    errors::ConfigError,
    events::{CircuitEvent, EventConsumer},
    state::CircuitState,
};
use std::sync::Arc;

type StateHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    max_concurrency: Option<usize>,
    consumers: Vec<Arc<dyn EventConsumer>>,
    hooks: Vec<(CircuitState, StateHook)>,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            clock: None,
            max_concurrency: None,
            consumers: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Use a prepared configuration (see [`Config::builder`])
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Inject the time source used for durations and time-based windows
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set maximum concurrency limit (bulkheading)
    ///
    /// `call()` rejects with `BulkheadFull` while `limit` calls are running.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tripwire::CircuitBreaker;
    ///
    /// let breaker = CircuitBreaker::builder("api")
    ///     .max_concurrency(10) // Allow max 10 concurrent calls
    ///     .build()
    ///     .unwrap();
    ///
    /// let result = breaker.call(|| Ok::<_, String>("success"));
    /// assert!(result.is_ok());
    /// ```
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Subscribe a consumer before the breaker handles its first call
    pub fn event_consumer(mut self, consumer: Arc<dyn EventConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn on_event<F>(self, f: F) -> Self
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.event_consumer(Arc::new(f))
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.push((CircuitState::Open, Arc::new(f)));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.push((CircuitState::Closed, Arc::new(f)));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.push((CircuitState::HalfOpen, Arc::new(f)));
        self
    }

    /// Build the circuit breaker, validating the configuration
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        let bulkhead = self
            .max_concurrency
            .map(Bulkhead::new)
            .transpose()?
            .map(Arc::new);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        let breaker = CircuitBreaker::from_parts(self.name, self.config, clock, bulkhead)?;

        let publisher = breaker.event_publisher();
        for consumer in self.consumers {
            publisher.subscribe(consumer);
        }
        for (target, hook) in self.hooks {
            publisher.on_state_transition(move |event, _from, to| {
                if to == target {
                    hook(&event.circuit_name);
                }
            });
        }

        Ok(breaker)
    }
}

impl std::fmt::Debug for CircuitBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("max_concurrency", &self.max_concurrency)
            .field("consumers", &self.consumers.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
