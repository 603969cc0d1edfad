//! Circuit breaker state machine
//!
//! The current state is an immutable [`BreakerState`] behind an `ArcSwap`.
//! Each state owns the metrics it records into; a transition builds the next
//! state and installs it with a pointer compare-and-swap against the state the
//! caller observed. Exactly one of several racing callers wins the swap and
//! publishes the transition, the rest see the new state on their next load.
//!
//! ```text
//! Closed ──breach──▶ Open ──wait elapsed──▶ HalfOpen ──trial ok──▶ Closed
//!                     ▲                        │
//!                     └──trial breach/timeout──┘
//! ```
//!
//! `Disabled`, `ForcedOpen` and `MetricsOnly` are only entered and left by
//! explicit transitions.

use crate::classifier::Classification;
use crate::clock::Clock;
use crate::config::Config;
use crate::errors::{CallNotPermitted, RejectionReason};
use crate::events::{CircuitEvent, EventKind, EventPublisher};
use crate::metrics::{CircuitMetrics, Metrics, Verdict};
use crate::timer::Timer;
use crate::window::Outcome;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    /// Always permits, records nothing
    Disabled,
    /// Always rejects, records nothing
    ForcedOpen,
    /// Always permits, records and reports breaches but never opens
    MetricsOnly,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Disabled => "DISABLED",
            CircuitState::ForcedOpen => "FORCED_OPEN",
            CircuitState::MetricsOnly => "METRICS_ONLY",
        }
    }

    /// Whether outcomes reported in this state reach the sliding window
    pub fn records_outcomes(&self) -> bool {
        !matches!(self, CircuitState::Disabled | CircuitState::ForcedOpen)
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open trial slots
#[derive(Debug)]
pub(crate) struct TrialBudget {
    permitted: u32,
    remaining: AtomicU32,
}

impl TrialBudget {
    fn new(permitted: u32) -> Self {
        Self {
            permitted,
            remaining: AtomicU32::new(permitted),
        }
    }

    /// Decrement if positive
    fn try_take(&self) -> bool {
        let mut current = self.remaining.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return false;
            }

            match self.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Increment, never past the configured budget
    fn give_back(&self) {
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.permitted).then_some(n + 1)
            });
    }

    #[cfg(test)]
    fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open {
        retry_after: Duration,
    },
    HalfOpen {
        trial: TrialBudget,
    },
    Disabled,
    ForcedOpen,
    MetricsOnly {
        failure_rate_exceeded: AtomicBool,
        slow_call_rate_exceeded: AtomicBool,
    },
}

/// One immutable incarnation of a state. Replaced wholesale on transition.
#[derive(Debug)]
pub(crate) struct BreakerState {
    phase: Phase,
    metrics: Arc<CircuitMetrics>,
    entered_at: Duration,
    /// Consecutive openings since the breaker was last closed
    attempts: u32,
}

impl BreakerState {
    fn state(&self) -> CircuitState {
        match self.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
            Phase::Disabled => CircuitState::Disabled,
            Phase::ForcedOpen => CircuitState::ForcedOpen,
            Phase::MetricsOnly { .. } => CircuitState::MetricsOnly,
        }
    }
}

/// Holds the current state and applies the transition rules
pub(crate) struct StateMachine {
    name: Arc<str>,
    config: ArcSwap<Config>,
    current: ArcSwap<BreakerState>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    timer: Arc<Timer>,
    weak_self: Weak<StateMachine>,
}

impl StateMachine {
    pub(crate) fn new(name: Arc<str>, config: Arc<Config>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let initial = BreakerState {
            phase: Phase::Closed,
            metrics: Arc::new(CircuitMetrics::for_window(&config, &clock)),
            entered_at: clock.now(),
            attempts: 0,
        };

        let timer = Timer::new(Arc::clone(&name), Arc::clone(&clock));
        Arc::new_cyclic(|weak_self| Self {
            name,
            config: ArcSwap::new(config),
            current: ArcSwap::from_pointee(initial),
            clock,
            events: EventPublisher::new(),
            timer,
            weak_self: weak_self.clone(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Applies to calls admitted after the swap. The window shape changes at
    /// the next state transition.
    pub(crate) fn change_config(&self, config: Arc<Config>) {
        self.config.store(config);
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.current.load().state()
    }

    pub(crate) fn metrics(&self) -> Metrics {
        self.current.load().metrics.snapshot()
    }

    /// Remaining half-open trial slots, `None` outside HalfOpen
    #[cfg(test)]
    pub(crate) fn trial_slots_remaining(&self) -> Option<u32> {
        match &self.current.load().phase {
            Phase::HalfOpen { trial } => Some(trial.remaining()),
            _ => None,
        }
    }

    /// Admission check. Never blocks.
    pub(crate) fn try_acquire(&self) -> Result<(), CallNotPermitted> {
        loop {
            let current = self.current.load_full();

            match &current.phase {
                Phase::Closed | Phase::Disabled | Phase::MetricsOnly { .. } => return Ok(()),
                Phase::ForcedOpen => return Err(self.reject(&current, RejectionReason::ForcedOpen)),
                Phase::Open { retry_after } => {
                    if self.clock.now() < *retry_after {
                        return Err(self.reject(&current, RejectionReason::Open));
                    }
                    // Winner or loser, the next pass sees HalfOpen
                    self.transition(&current, CircuitState::HalfOpen, None);
                }
                Phase::HalfOpen { trial } => {
                    if self.half_open_expired(&current) {
                        self.transition(&current, CircuitState::Open, None);
                        continue;
                    }
                    if trial.try_take() {
                        return Ok(());
                    }
                    return Err(self.reject(&current, RejectionReason::HalfOpenBudgetExhausted));
                }
            }
        }
    }

    /// Hand back a half-open slot taken by a call that never ran
    pub(crate) fn release(&self) {
        if let Phase::HalfOpen { trial } = &self.current.load().phase {
            trial.give_back();
            debug!(circuit = %self.name, "half-open permission released");
        }
    }

    /// `config` is the snapshot the caller classified the outcome under
    pub(crate) fn on_success(&self, config: &Config, duration: Duration) {
        self.record(config, duration, Outcome::Success, EventKind::Success { duration });
    }

    pub(crate) fn on_error(
        &self,
        config: &Config,
        duration: Duration,
        classification: Classification,
        error_type: &'static str,
    ) {
        match classification {
            Classification::Failure => self.record(
                config,
                duration,
                Outcome::Failure,
                EventKind::Error {
                    duration,
                    error_type,
                },
            ),
            Classification::Ignored => self.record(
                config,
                duration,
                Outcome::Ignored,
                EventKind::IgnoredError {
                    duration,
                    error_type,
                },
            ),
            Classification::Success => self.on_success(config, duration),
        }
    }

    fn record(&self, config: &Config, duration: Duration, outcome: Outcome, event: EventKind) {
        let current = self.current.load_full();
        if !current.state().records_outcomes() {
            return;
        }

        self.publish(event);
        let (metrics, verdict) = current.metrics.record(config, duration, outcome);

        match &current.phase {
            Phase::Closed => {
                if let Verdict::AboveThresholds { .. } = verdict {
                    self.transition(&current, CircuitState::Open, Some((&metrics, verdict)));
                }
            }
            Phase::HalfOpen { trial } => {
                trial.give_back();
                match verdict {
                    Verdict::AboveThresholds { .. } => {
                        self.transition(&current, CircuitState::Open, Some((&metrics, verdict)));
                    }
                    Verdict::BelowThresholds => {
                        self.transition(&current, CircuitState::Closed, None);
                    }
                    Verdict::BelowMinimumCalls => {}
                }
            }
            Phase::MetricsOnly {
                failure_rate_exceeded,
                slow_call_rate_exceeded,
            } => {
                let (failure_rate, slow_call_rate) = match verdict {
                    Verdict::AboveThresholds {
                        failure_rate,
                        slow_call_rate,
                    } => (failure_rate, slow_call_rate),
                    Verdict::BelowThresholds => (false, false),
                    Verdict::BelowMinimumCalls => return,
                };
                // Report each breach once, re-arm when the rate recovers
                let new_failure = failure_rate && !failure_rate_exceeded.swap(true, Ordering::AcqRel);
                let new_slow = slow_call_rate && !slow_call_rate_exceeded.swap(true, Ordering::AcqRel);
                if !failure_rate {
                    failure_rate_exceeded.store(false, Ordering::Release);
                }
                if !slow_call_rate {
                    slow_call_rate_exceeded.store(false, Ordering::Release);
                }
                self.publish_breach(&metrics, new_failure, new_slow);
            }
            // Outcome of a call admitted before the circuit opened
            Phase::Open { .. } => {}
            Phase::Disabled | Phase::ForcedOpen => {}
        }
    }

    /// Administrative override, always applied
    pub(crate) fn transition_to(&self, to: CircuitState) {
        loop {
            let current = self.current.load_full();
            if self.transition(&current, to, None) {
                return;
            }
        }
    }

    /// Back to a fresh Closed state with empty metrics
    pub(crate) fn reset(&self) {
        let config = self.config.load();
        let fresh = Arc::new(self.next_state(&self.current.load(), CircuitState::Closed, &config));
        let previous = self.current.swap(Arc::clone(&fresh));
        self.schedule(&fresh, &config);

        if previous.state() != CircuitState::Closed {
            info!(circuit = %self.name, from = %previous.state(), to = "CLOSED", "circuit breaker changed state");
            self.publish(EventKind::StateTransition {
                from: previous.state(),
                to: CircuitState::Closed,
            });
        }
        info!(circuit = %self.name, "circuit breaker reset");
        self.publish(EventKind::Reset);
    }

    fn half_open_expired(&self, state: &BreakerState) -> bool {
        self.config
            .load()
            .max_wait_duration_in_half_open_state
            .filter(|max_wait| !max_wait.is_zero())
            .is_some_and(|max_wait| {
                self.clock.now() >= state.entered_at.saturating_add(max_wait)
            })
    }

    fn reject(&self, state: &BreakerState, reason: RejectionReason) -> CallNotPermitted {
        state.metrics.on_call_not_permitted();
        debug!(circuit = %self.name, state = %state.state(), reason = reason.as_str(), "call not permitted");
        self.publish(EventKind::NotPermitted);
        CallNotPermitted {
            circuit: self.name.to_string(),
            state: state.state(),
            reason,
        }
    }

    /// Install the successor of `expected`. Returns false if another caller
    /// replaced `expected` first.
    fn transition(
        &self,
        expected: &Arc<BreakerState>,
        to: CircuitState,
        breach: Option<(&Metrics, Verdict)>,
    ) -> bool {
        let config = self.config.load();
        let next = Arc::new(self.next_state(expected, to, &config));
        let previous = self.current.compare_and_swap(expected, Arc::clone(&next));
        if !Arc::ptr_eq(&*previous, expected) {
            return false;
        }

        if let Some((
            metrics,
            Verdict::AboveThresholds {
                failure_rate,
                slow_call_rate,
            },
        )) = breach
        {
            self.publish_breach(metrics, failure_rate, slow_call_rate);
        }

        let from = expected.state();
        info!(circuit = %self.name, %from, %to, "circuit breaker changed state");
        self.publish(EventKind::StateTransition { from, to });
        self.schedule(&next, &config);
        true
    }

    fn next_state(&self, from: &BreakerState, to: CircuitState, config: &Config) -> BreakerState {
        let now = self.clock.now();
        let fresh_window = || Arc::new(CircuitMetrics::for_window(config, &self.clock));

        match to {
            CircuitState::Open => {
                let attempts = from.attempts.saturating_add(1);
                let wait = config.wait_interval_in_open_state.wait_duration(attempts);
                BreakerState {
                    phase: Phase::Open {
                        retry_after: now.saturating_add(wait),
                    },
                    // Keep the window that explains why the circuit opened
                    metrics: Arc::clone(&from.metrics),
                    entered_at: now,
                    attempts,
                }
            }
            CircuitState::HalfOpen => BreakerState {
                phase: Phase::HalfOpen {
                    trial: TrialBudget::new(config.permitted_number_of_calls_in_half_open_state),
                },
                metrics: Arc::new(CircuitMetrics::for_trial(config)),
                entered_at: now,
                attempts: from.attempts,
            },
            CircuitState::Closed => BreakerState {
                phase: Phase::Closed,
                metrics: fresh_window(),
                entered_at: now,
                attempts: 0,
            },
            CircuitState::Disabled => BreakerState {
                phase: Phase::Disabled,
                metrics: fresh_window(),
                entered_at: now,
                attempts: 0,
            },
            CircuitState::ForcedOpen => BreakerState {
                phase: Phase::ForcedOpen,
                metrics: fresh_window(),
                entered_at: now,
                attempts: 0,
            },
            CircuitState::MetricsOnly => BreakerState {
                phase: Phase::MetricsOnly {
                    failure_rate_exceeded: AtomicBool::new(false),
                    slow_call_rate_exceeded: AtomicBool::new(false),
                },
                metrics: fresh_window(),
                entered_at: now,
                attempts: 0,
            },
        }
    }

    /// With automatic transitions enabled, arm the timer for the state's
    /// deadline, otherwise clear it. The lazy check in `try_acquire` still
    /// applies if the timer never fires.
    fn schedule(&self, state: &Arc<BreakerState>, config: &Config) {
        let deadline = match (&state.phase, config.max_wait_duration_in_half_open_state) {
            _ if !config.automatic_transition_from_open_to_half_open_enabled => None,
            (Phase::Open { retry_after }, _) => Some((*retry_after, CircuitState::HalfOpen)),
            (Phase::HalfOpen { .. }, Some(max_wait)) if !max_wait.is_zero() => {
                Some((state.entered_at.saturating_add(max_wait), CircuitState::Open))
            }
            _ => None,
        };

        let Some((at, to)) = deadline else {
            self.timer.disarm();
            return;
        };

        let machine = self.weak_self.clone();
        let expected = Arc::downgrade(state);
        self.timer.arm(at, move || {
            if let (Some(machine), Some(expected)) = (machine.upgrade(), expected.upgrade()) {
                machine.transition(&expected, to, None);
            }
        });
    }

    fn publish_breach(&self, metrics: &Metrics, failure_rate: bool, slow_call_rate: bool) {
        if failure_rate {
            warn!(circuit = %self.name, failure_rate = metrics.failure_rate, "failure rate threshold exceeded");
            self.publish(EventKind::FailureRateExceeded {
                failure_rate: metrics.failure_rate,
            });
        }
        if slow_call_rate {
            warn!(circuit = %self.name, slow_call_rate = metrics.slow_call_rate, "slow call rate threshold exceeded");
            self.publish(EventKind::SlowCallRateExceeded {
                slow_call_rate: metrics.slow_call_rate,
            });
        }
    }

    fn publish(&self, kind: EventKind) {
        if !self.events.has_consumers() {
            return;
        }
        self.events.publish(&CircuitEvent {
            circuit_name: Arc::clone(&self.name),
            timestamp: self.clock.now(),
            kind,
        });
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &*self.config.load())
            .field("events", &self.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SlidingWindowType;
    use std::sync::Barrier;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const MS: Duration = Duration::from_millis(1);

    fn machine(config: Config) -> (Arc<StateMachine>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let machine = StateMachine::new(Arc::from("test"), Arc::new(config), clock.clone());
        (machine, clock)
    }

    fn config() -> Config {
        Config::builder()
            .sliding_window(SlidingWindowType::CountBased, 4)
            .minimum_number_of_calls(4)
            .failure_rate_threshold(50.0)
            .permitted_number_of_calls_in_half_open_state(3)
            .wait_duration_in_open_state(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    fn transitions(machine: &StateMachine) -> Arc<Mutex<Vec<(CircuitState, CircuitState)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        machine.events().on_state_transition(move |_, from, to| {
            seen_clone.lock().unwrap().push((from, to));
        });
        seen
    }

    fn fail(machine: &StateMachine) {
        machine.on_error(&machine.config(), MS, Classification::Failure, "test::Error");
    }

    fn trip(machine: &StateMachine) {
        for _ in 0..4 {
            fail(machine);
        }
        assert_eq!(machine.state(), CircuitState::Open);
    }

    #[test]
    fn test_opens_exactly_once_at_threshold() {
        let (machine, _) = machine(config());
        let seen = transitions(&machine);

        fail(&machine);
        fail(&machine);
        machine.on_success(&machine.config(), MS);
        assert_eq!(machine.state(), CircuitState::Closed);

        machine.on_success(&machine.config(), MS);
        assert_eq!(machine.state(), CircuitState::Open);
        assert_eq!(machine.metrics().failure_rate, 50.0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[test]
    fn test_no_transition_below_minimum_calls() {
        let (machine, _) = machine(config());

        for _ in 0..3 {
            fail(&machine);
        }

        assert_eq!(machine.state(), CircuitState::Closed);
        assert_eq!(machine.metrics().failure_rate, -1.0);
    }

    #[test]
    fn test_open_rejects_until_wait_elapsed() {
        let (machine, clock) = machine(config());
        trip(&machine);

        for _ in 0..5 {
            let err = machine.try_acquire().unwrap_err();
            assert_eq!(err.reason, RejectionReason::Open);
        }
        assert_eq!(machine.metrics().number_of_not_permitted_calls, 5);

        clock.advance(Duration::from_secs(9));
        assert!(machine.try_acquire().is_err());

        clock.advance(Duration::from_secs(1));
        assert!(machine.try_acquire().is_ok());
        assert_eq!(machine.state(), CircuitState::HalfOpen);
        assert_eq!(machine.trial_slots_remaining(), Some(2));
    }

    #[test]
    fn test_rejections_do_not_touch_window() {
        let (machine, _) = machine(config());
        trip(&machine);

        let before = machine.metrics().number_of_calls;
        let _ = machine.try_acquire();
        let _ = machine.try_acquire();
        assert_eq!(machine.metrics().number_of_calls, before);
    }

    #[test]
    fn test_half_open_budget_under_race() {
        for _ in 0..20 {
            let (machine, _) = machine(config());
            machine.transition_to(CircuitState::HalfOpen);

            let barrier = Arc::new(Barrier::new(8));
            let granted = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let machine = Arc::clone(&machine);
                    let barrier = Arc::clone(&barrier);
                    let granted = Arc::clone(&granted);
                    thread::spawn(move || {
                        barrier.wait();
                        if machine.try_acquire().is_ok() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(granted.load(Ordering::SeqCst), 3);
            assert_eq!(machine.metrics().number_of_not_permitted_calls, 5);
        }
    }

    #[test]
    fn test_half_open_budget_exhausted_reason() {
        let (machine, _) = machine(config());
        machine.transition_to(CircuitState::HalfOpen);

        for _ in 0..3 {
            machine.try_acquire().unwrap();
        }
        let err = machine.try_acquire().unwrap_err();
        assert_eq!(err.reason, RejectionReason::HalfOpenBudgetExhausted);
        assert_eq!(err.state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_release_restores_slot_within_bound() {
        let (machine, _) = machine(config());
        machine.transition_to(CircuitState::HalfOpen);

        machine.try_acquire().unwrap();
        assert_eq!(machine.trial_slots_remaining(), Some(2));
        machine.release();
        assert_eq!(machine.trial_slots_remaining(), Some(3));

        // Never beyond the configured budget
        machine.release();
        assert_eq!(machine.trial_slots_remaining(), Some(3));
    }

    #[test]
    fn test_half_open_closes_after_successful_trial() {
        let (machine, _) = machine(config());
        let seen = transitions(&machine);
        machine.transition_to(CircuitState::HalfOpen);

        for _ in 0..3 {
            machine.try_acquire().unwrap();
            machine.on_success(&machine.config(), MS);
        }

        assert_eq!(machine.state(), CircuitState::Closed);
        assert_eq!(machine.metrics().number_of_calls, 0);
        assert_eq!(
            seen.lock().unwrap().last(),
            Some(&(CircuitState::HalfOpen, CircuitState::Closed))
        );
    }

    #[test]
    fn test_half_open_reopens_on_failed_trial() {
        let (machine, _) = machine(config());
        machine.transition_to(CircuitState::HalfOpen);

        machine.on_success(&machine.config(), MS);
        fail(&machine);
        assert_eq!(machine.state(), CircuitState::HalfOpen);

        fail(&machine);
        assert_eq!(machine.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_max_wait_forces_open() {
        let config = config()
            .to_builder()
            .max_wait_duration_in_half_open_state(Duration::from_secs(5))
            .build()
            .unwrap();
        let (machine, clock) = machine(config);
        machine.transition_to(CircuitState::HalfOpen);
        machine.try_acquire().unwrap();

        clock.advance(Duration::from_secs(5));
        let err = machine.try_acquire().unwrap_err();
        assert_eq!(err.reason, RejectionReason::Open);
        assert_eq!(machine.state(), CircuitState::Open);
    }

    #[test]
    fn test_wait_grows_with_consecutive_openings() {
        let config = config()
            .to_builder()
            .wait_interval_in_open_state(crate::config::WaitInterval::Custom(Arc::new(
                |attempt| Duration::from_secs(u64::from(attempt) * 10),
            )))
            .build()
            .unwrap();
        let (machine, clock) = machine(config);
        trip(&machine);

        clock.advance(Duration::from_secs(10));
        machine.try_acquire().unwrap();
        fail(&machine);
        fail(&machine);
        fail(&machine);
        assert_eq!(machine.state(), CircuitState::Open);

        // Second opening waits 20s
        clock.advance(Duration::from_secs(19));
        assert!(machine.try_acquire().is_err());
        clock.advance(Duration::from_secs(1));
        assert!(machine.try_acquire().is_ok());
    }

    #[test]
    fn test_concurrent_breach_transitions_once() {
        for _ in 0..20 {
            let config = Config::builder()
                .sliding_window(SlidingWindowType::CountBased, 100)
                .minimum_number_of_calls(10)
                .build()
                .unwrap();
            let (machine, _) = machine(config);
            let seen = transitions(&machine);

            let barrier = Arc::new(Barrier::new(16));
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let machine = Arc::clone(&machine);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        fail(&machine);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(machine.state(), CircuitState::Open);
            assert_eq!(seen.lock().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_disabled_permits_and_records_nothing() {
        let (machine, _) = machine(config());
        machine.transition_to(CircuitState::Disabled);

        for _ in 0..10 {
            assert!(machine.try_acquire().is_ok());
            fail(&machine);
        }
        assert_eq!(machine.state(), CircuitState::Disabled);
        assert_eq!(machine.metrics().number_of_calls, 0);
    }

    #[test]
    fn test_forced_open_rejects_and_records_nothing() {
        let (machine, clock) = machine(config());
        machine.transition_to(CircuitState::ForcedOpen);

        clock.advance(Duration::from_secs(3600));
        let err = machine.try_acquire().unwrap_err();
        assert_eq!(err.reason, RejectionReason::ForcedOpen);

        machine.on_success(&machine.config(), MS);
        let metrics = machine.metrics();
        assert_eq!(metrics.number_of_calls, 0);
        assert_eq!(metrics.number_of_not_permitted_calls, 1);
        assert_eq!(machine.state(), CircuitState::ForcedOpen);
    }

    #[test]
    fn test_metrics_only_reports_breach_once_and_never_opens() {
        let (machine, _) = machine(config());
        machine.transition_to(CircuitState::MetricsOnly);

        let breaches = Arc::new(AtomicUsize::new(0));
        let breaches_clone = Arc::clone(&breaches);
        machine.events().on_event(move |event| {
            if let EventKind::FailureRateExceeded { .. } = event.kind {
                breaches_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..8 {
            assert!(machine.try_acquire().is_ok());
            fail(&machine);
        }
        assert_eq!(machine.state(), CircuitState::MetricsOnly);
        assert_eq!(machine.metrics().number_of_failed_calls, 4);
        assert_eq!(breaches.load(Ordering::SeqCst), 1);

        // Recover, then breach again
        for _ in 0..4 {
            machine.on_success(&machine.config(), MS);
        }
        for _ in 0..2 {
            fail(&machine);
        }
        assert_eq!(breaches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ignored_errors_never_trip() {
        let (machine, _) = machine(config());

        for _ in 0..10 {
            machine.on_error(&machine.config(), MS, Classification::Ignored, "test::Ignored");
        }

        let metrics = machine.metrics();
        assert_eq!(machine.state(), CircuitState::Closed);
        assert_eq!(metrics.number_of_calls, 4);
        assert_eq!(metrics.number_of_failed_calls, 0);
        assert_eq!(metrics.failure_rate, 0.0);
    }

    #[test]
    fn test_reset_from_any_state() {
        for target in [
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::Disabled,
            CircuitState::ForcedOpen,
            CircuitState::MetricsOnly,
            CircuitState::Closed,
        ] {
            let (machine, _) = machine(config());
            fail(&machine);
            machine.transition_to(target);
            let _ = machine.try_acquire();

            machine.reset();
            let metrics = machine.metrics();
            assert_eq!(machine.state(), CircuitState::Closed);
            assert_eq!(metrics.number_of_calls, 0);
            assert_eq!(metrics.number_of_not_permitted_calls, 0);
        }
    }

    #[test]
    fn test_admin_transitions_emit_events() {
        let (machine, _) = machine(config());
        let seen = transitions(&machine);

        machine.transition_to(CircuitState::ForcedOpen);
        machine.transition_to(CircuitState::Disabled);
        machine.transition_to(CircuitState::Closed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::ForcedOpen),
                (CircuitState::ForcedOpen, CircuitState::Disabled),
                (CircuitState::Disabled, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_automatic_transition_timer() {
        let config = config()
            .to_builder()
            .wait_duration_in_open_state(Duration::from_millis(20))
            .automatic_transition_from_open_to_half_open_enabled(true)
            .build()
            .unwrap();
        let machine = StateMachine::new(
            Arc::from("timer"),
            Arc::new(config),
            Arc::new(crate::clock::SystemClock::new()),
        );

        machine.transition_to(CircuitState::Open);
        assert_eq!(machine.state(), CircuitState::Open);

        let mut waited = Duration::ZERO;
        while machine.state() == CircuitState::Open && waited < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        assert_eq!(machine.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_unbounded_open_wait_never_elapses() {
        let config = config()
            .to_builder()
            .wait_duration_in_open_state(Duration::MAX)
            .automatic_transition_from_open_to_half_open_enabled(true)
            .build()
            .unwrap();
        let (machine, clock) = machine(config);
        clock.advance(Duration::from_secs(1));

        trip(&machine);
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        let err = machine.try_acquire().unwrap_err();
        assert_eq!(err.reason, RejectionReason::Open);
        assert_eq!(machine.state(), CircuitState::Open);
    }

    #[test]
    fn test_unbounded_half_open_wait_never_expires() {
        let config = config()
            .to_builder()
            .max_wait_duration_in_half_open_state(Duration::MAX)
            .automatic_transition_from_open_to_half_open_enabled(true)
            .build()
            .unwrap();
        let (machine, clock) = machine(config);
        clock.advance(Duration::from_secs(1));

        machine.transition_to(CircuitState::HalfOpen);
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(machine.try_acquire().is_ok());
        assert_eq!(machine.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_huge_custom_wait_saturates() {
        let config = config()
            .to_builder()
            .wait_interval_in_open_state(crate::config::WaitInterval::Custom(Arc::new(
                |_| Duration::MAX,
            )))
            .build()
            .unwrap();
        let (machine, clock) = machine(config);
        clock.advance(Duration::from_secs(1));

        trip(&machine);
        assert_eq!(
            machine.try_acquire().unwrap_err().reason,
            RejectionReason::Open
        );
    }

    #[test]
    fn test_repeated_openings_share_one_timer() {
        let config = config()
            .to_builder()
            .automatic_transition_from_open_to_half_open_enabled(true)
            .build()
            .unwrap();
        let (machine, clock) = machine(config);
        let seen = transitions(&machine);

        for _ in 0..50 {
            machine.transition_to(CircuitState::Open);
            machine.transition_to(CircuitState::Closed);
        }
        machine.transition_to(CircuitState::Open);
        assert!(machine.timer.is_armed());
        seen.lock().unwrap().clear();

        clock.advance(Duration::from_secs(10));
        let mut waited = Duration::ZERO;
        while machine.state() == CircuitState::Open && waited < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        thread::sleep(Duration::from_millis(50));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(CircuitState::Open, CircuitState::HalfOpen)]
        );
    }

    #[test]
    fn test_leaving_timed_state_disarms_timer() {
        let config = config()
            .to_builder()
            .automatic_transition_from_open_to_half_open_enabled(true)
            .build()
            .unwrap();
        let (machine, _) = machine(config);

        machine.transition_to(CircuitState::Open);
        assert!(machine.timer.is_armed());
        machine.transition_to(CircuitState::ForcedOpen);
        assert!(!machine.timer.is_armed());

        machine.transition_to(CircuitState::Open);
        machine.reset();
        assert!(!machine.timer.is_armed());
    }
}
