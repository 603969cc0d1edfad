//! Deadline thread for automatic state changes
//!
//! Each breaker owns at most one timer thread, started on first use. The
//! thread holds a single pending deadline; arming a new one replaces it, so
//! repeated transitions never stack up sleeping threads. The thread exits on
//! its own once the owning breaker is dropped.

use crate::clock::Clock;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Longest single park; bounds how late a manual clock advance or a dropped
/// breaker is noticed
const MAX_PARK: Duration = Duration::from_millis(250);

type Action = Box<dyn FnOnce() + Send>;

struct Pending {
    at: Duration,
    fire: Action,
}

#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
    running: bool,
}

pub(crate) struct Timer {
    name: Arc<str>,
    clock: Arc<dyn Clock>,
    slot: Mutex<Slot>,
    wake: Condvar,
}

impl Timer {
    pub(crate) fn new(name: Arc<str>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            name,
            clock,
            slot: Mutex::new(Slot::default()),
            wake: Condvar::new(),
        })
    }

    /// Run `fire` once the clock reaches `at`, replacing any pending deadline
    pub(crate) fn arm<F>(self: &Arc<Self>, at: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.lock();
        slot.pending = Some(Pending {
            at,
            fire: Box::new(fire),
        });

        if slot.running {
            self.wake.notify_one();
            return;
        }

        let timer = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("tripwire-{}", self.name))
            .spawn(move || timer.run());
        match spawned {
            Ok(_) => slot.running = true,
            Err(error) => {
                slot.pending = None;
                warn!(circuit = %self.name, %error, "failed to start transition timer");
            }
        }
    }

    /// Drop the pending deadline, if any
    pub(crate) fn disarm(&self) {
        self.lock().pending = None;
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.lock().pending.is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.lock().running
    }

    fn run(self: Arc<Self>) {
        let mut slot = self.lock();
        loop {
            // Only this thread still holds the timer: the breaker is gone
            if Arc::strong_count(&self) == 1 {
                slot.running = false;
                return;
            }

            let now = self.clock.now();
            let park = match slot.pending.as_ref().map(|pending| pending.at) {
                Some(at) if at <= now => {
                    if let Some(pending) = slot.pending.take() {
                        drop(slot);
                        (pending.fire)();
                        slot = self.lock();
                    }
                    continue;
                }
                Some(at) => (at - now).min(MAX_PARK),
                None => MAX_PARK,
            };

            slot = self
                .wake
                .wait_timeout(slot, park)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
