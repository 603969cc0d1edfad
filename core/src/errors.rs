//! Error types for circuit breaker operations

use crate::state::CircuitState;

/// Why a call was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// The circuit is open and the wait duration has not elapsed
    Open,
    /// The circuit was forced open by an administrator
    ForcedOpen,
    /// Every half-open trial slot is taken
    HalfOpenBudgetExhausted,
    /// The bulkhead in front of the breaker is at capacity
    BulkheadFull,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Open => "open",
            RejectionReason::ForcedOpen => "forced open",
            RejectionReason::HalfOpenBudgetExhausted => "half-open trial budget exhausted",
            RejectionReason::BulkheadFull => "bulkhead full",
        }
    }
}

/// A call was rejected by the circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit '{circuit}' does not permit further calls ({})", .reason.as_str())]
pub struct CallNotPermitted {
    pub circuit: String,
    pub state: CircuitState,
    pub reason: RejectionReason,
}

/// Errors that can occur when executing through the circuit breaker
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E = Box<dyn std::error::Error + Send + Sync>> {
    /// The breaker rejected the call
    #[error(transparent)]
    NotPermitted(#[from] CallNotPermitted),
    /// Bulkhead is at capacity, cannot acquire permit
    #[error("Circuit '{circuit}' bulkhead is full (limit: {limit})")]
    BulkheadFull { circuit: String, limit: usize },
    /// The wrapped operation failed
    #[error("Circuit execution failed: {0}")]
    Execution(E),
}

impl<E> CircuitError<E> {
    /// Whether the call never reached the protected operation
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CircuitError::Execution(_))
    }

    pub fn into_execution(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// Invalid circuit breaker configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failure rate threshold must be in (0, 100], got {0}")]
    FailureRateThreshold(f32),
    #[error("slow call rate threshold must be in (0, 100], got {0}")]
    SlowCallRateThreshold(f32),
    #[error("slow call duration threshold must be greater than zero")]
    SlowCallDurationThreshold,
    #[error("sliding window size must be greater than zero")]
    SlidingWindowSize,
    #[error("minimum number of calls must be greater than zero")]
    MinimumNumberOfCalls,
    #[error("permitted number of calls in half-open state must be greater than zero")]
    PermittedCallsInHalfOpenState,
    #[error("wait duration in open state must be greater than zero")]
    WaitDurationInOpenState,
    #[error("backoff multiplier must be at least 1.0, got {0}")]
    BackoffMultiplier(f64),
    #[error("jitter factor must be in [0, 1], got {0}")]
    JitterFactor(f64),
    #[error("bulkhead limit must be greater than zero")]
    BulkheadLimit,
    #[error("unknown base configuration '{0}'")]
    UnknownBaseConfig(String),
    #[error("base configuration '{0}' inherits from itself")]
    BaseConfigCycle(String),
    #[error("invalid circuit breaker properties: {0}")]
    Parse(#[from] toml::de::Error),
}
