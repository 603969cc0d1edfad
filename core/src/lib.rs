//! Tripwire - Call-admission circuit breaker
//!
//! This crate provides a complete circuit breaker implementation with:
//! - Count-based and time-based sliding windows with O(1) running totals
//! - Lock-free state transitions (Closed, Open, HalfOpen, Disabled,
//!   ForcedOpen, MetricsOnly) that happen exactly once under contention
//! - Failure-rate and slow-call-rate thresholds, a bounded half-open trial
//! - Events, metrics snapshots, a named registry and TOML properties
//!
//! # Example
//!
//! ```rust
//! use tripwire::{CircuitBreaker, CircuitState, Config, SlidingWindowType};
//! use std::time::Duration;
//!
//! let config = Config::builder()
//!     .failure_rate_threshold(50.0)
//!     .sliding_window(SlidingWindowType::CountBased, 10)
//!     .minimum_number_of_calls(4)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//!
//! let breaker = CircuitBreaker::builder("payment_api")
//!     .config(config)
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .unwrap();
//!
//! // Execute with circuit protection
//! let result = breaker.call(|| {
//!     // Your service call here
//!     Ok::<_, String>("success")
//! });
//! assert!(result.is_ok());
//!
//! for _ in 0..4 {
//!     let _ = breaker.call(|| Err::<(), _>("timeout".to_string()));
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//! ```

pub mod builder;
pub mod bulkhead;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod properties;
pub mod registry;
pub mod state;
mod timer;
pub mod window;

pub use builder::CircuitBuilder;
pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use circuit::{CallOptions, CircuitBreaker, FallbackContext, IntoCallOptions};
pub use classifier::{
    Classification, DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier,
    ResultPredicate,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigBuilder, SlidingWindowType, WaitInterval};
pub use errors::{CallNotPermitted, CircuitError, ConfigError, RejectionReason};
pub use events::{CircuitEvent, EventConsumer, EventKind, EventPublisher, SubscriptionId};
pub use metrics::{Metrics, UNRELIABLE_RATE};
pub use properties::{InstanceProperties, RegistryProperties};
pub use registry::{CircuitBreakerRegistry, RegistryEvent};
pub use state::CircuitState;
pub use window::{Bucket, CountWindow, Outcome, SlidingWindow, TimeWindow};
