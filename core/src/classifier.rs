//! Outcome classification
//!
//! A classifier decides how a failed call is accounted for: as a failure that
//! counts toward the failure rate, as an ignored call, or as a success (the
//! error is expected and says nothing about the dependency's health).

use std::any::Any;
use std::sync::Arc;

/// How a reported error is recorded in the sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Counted as a successful call
    Success,
    /// Counted toward the failure rate
    Failure,
    /// Counted as a call but never as a failure
    Ignored,
}

/// Context handed to failure classifiers
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit name
    pub circuit_name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Type name of the error, as reported in error events
    pub error_type: &'static str,
    /// Duration of the failed call
    pub duration: std::time::Duration,
}

/// Decides how an error reported through `on_error` is recorded
///
/// # Examples
///
/// ```rust
/// use tripwire::{Classification, FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct ServerErrorsOnly;
///
/// impl FailureClassifier for ServerErrorsOnly {
///     fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
///         match ctx.error.downcast_ref::<u16>() {
///             Some(status) if *status < 500 => Classification::Ignored,
///             _ => Classification::Failure,
///         }
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification;
}

/// Records every error as a failure
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, _ctx: &FailureContext<'_>) -> Classification {
        Classification::Failure
    }
}

type Predicate = Arc<dyn Fn(&FailureContext<'_>) -> bool + Send + Sync>;

/// Classifier built from a record/ignore predicate pair
///
/// The ignore predicate wins. Errors matched by neither predicate are
/// recorded as successes.
#[derive(Clone)]
pub struct PredicateClassifier {
    record: Predicate,
    ignore: Option<Predicate>,
}

impl PredicateClassifier {
    /// Record errors matching `record` as failures, everything else as success
    pub fn new<F>(record: F) -> Self
    where
        F: Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            record: Arc::new(record),
            ignore: None,
        }
    }

    /// Ignore errors matching `ignore` before the record predicate runs
    pub fn ignoring<F>(mut self, ignore: F) -> Self
    where
        F: Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.ignore = Some(Arc::new(ignore));
        self
    }
}

impl FailureClassifier for PredicateClassifier {
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
        if self.ignore.as_ref().is_some_and(|ignore| ignore(ctx)) {
            Classification::Ignored
        } else if (self.record)(ctx) {
            Classification::Failure
        } else {
            Classification::Success
        }
    }
}

impl std::fmt::Debug for PredicateClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("record", &"<closure>")
            .field("ignore", &self.ignore.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// Predicate marking a successful result as a failure
pub type ResultPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;
