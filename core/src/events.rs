//! Circuit breaker events and per-breaker fan-out
//!
//! Every breaker owns one [`EventPublisher`]. Consumers are added and removed
//! explicitly; a consumer only sees events published after it subscribed.

use crate::state::CircuitState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Event payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    StateTransition {
        from: CircuitState,
        to: CircuitState,
    },
    Success {
        duration: Duration,
    },
    Error {
        duration: Duration,
        error_type: &'static str,
    },
    IgnoredError {
        duration: Duration,
        error_type: &'static str,
    },
    NotPermitted,
    Reset,
    FailureRateExceeded {
        failure_rate: f32,
    },
    SlowCallRateExceeded {
        slow_call_rate: f32,
    },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateTransition { .. } => "state_transition",
            EventKind::Success { .. } => "success",
            EventKind::Error { .. } => "error",
            EventKind::IgnoredError { .. } => "ignored_error",
            EventKind::NotPermitted => "not_permitted",
            EventKind::Reset => "reset",
            EventKind::FailureRateExceeded { .. } => "failure_rate_exceeded",
            EventKind::SlowCallRateExceeded { .. } => "slow_call_rate_exceeded",
        }
    }
}

/// An immutable event emitted by a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitEvent {
    pub circuit_name: Arc<str>,
    /// Reading of the breaker's clock when the event was created
    pub timestamp: Duration,
    pub kind: EventKind,
}

impl std::fmt::Display for CircuitEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.3}s: CircuitBreaker '{}' ",
            self.timestamp.as_secs_f64(),
            self.circuit_name
        )?;
        match &self.kind {
            EventKind::StateTransition { from, to } => {
                write!(f, "changed state from {} to {}", from, to)
            }
            EventKind::Success { duration } => {
                write!(f, "recorded a successful call in {}ms", duration.as_millis())
            }
            EventKind::Error {
                duration,
                error_type,
            } => write!(
                f,
                "recorded an error '{}' in {}ms",
                error_type,
                duration.as_millis()
            ),
            EventKind::IgnoredError {
                duration,
                error_type,
            } => write!(
                f,
                "ignored an error '{}' in {}ms",
                error_type,
                duration.as_millis()
            ),
            EventKind::NotPermitted => f.write_str("recorded a call which was not permitted"),
            EventKind::Reset => f.write_str("reset"),
            EventKind::FailureRateExceeded { failure_rate } => {
                write!(f, "exceeded failure rate threshold, current: {failure_rate}%")
            }
            EventKind::SlowCallRateExceeded { slow_call_rate } => write!(
                f,
                "exceeded slow call rate threshold, current: {slow_call_rate}%"
            ),
        }
    }
}

/// Receives events from a publisher
pub trait EventConsumer: Send + Sync {
    fn consume(&self, event: &CircuitEvent);
}

impl<F> EventConsumer for F
where
    F: Fn(&CircuitEvent) + Send + Sync,
{
    fn consume(&self, event: &CircuitEvent) {
        self(event)
    }
}

/// Handle returned by [`EventPublisher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of events to the currently subscribed consumers
#[derive(Default)]
pub struct EventPublisher {
    consumers: RwLock<Vec<(SubscriptionId, Arc<dyn EventConsumer>)>>,
    next_id: AtomicU64,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, consumer: Arc<dyn EventConsumer>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, consumer));
        id
    }

    /// Subscribe a closure
    pub fn on_event<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(f))
    }

    /// Subscribe a closure to state transitions only
    pub fn on_state_transition<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&CircuitEvent, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let EventKind::StateTransition { from, to } = event.kind {
                f(event, from, to);
            }
        })
    }

    /// Returns false when the subscription was already removed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut consumers = self
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = consumers.len();
        consumers.retain(|(existing, _)| *existing != id);
        consumers.len() != before
    }

    pub fn has_consumers(&self) -> bool {
        !self
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn publish(&self, event: &CircuitEvent) {
        // Consumers run outside the lock so they may subscribe or unsubscribe
        let consumers: Vec<_> = self
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, consumer)| Arc::clone(consumer))
            .collect();

        for consumer in consumers {
            consumer.consume(event);
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .consumers
            .read()
            .map(|consumers| consumers.len())
            .unwrap_or(0);
        f.debug_struct("EventPublisher")
            .field("consumers", &count)
            .finish()
    }
}
