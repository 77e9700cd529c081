//! The simulated-clock subsystem.
//!
//! When `/use_sim_time` is set, time is whatever the last `/clock` message
//! said it was, and sleeps become waits for the clock to pass a target value.
//! The state sits behind one readers-writer lock: many concurrent `now()`
//! readers, a single writer in the clock callback.

use log::*;
use rosnative_common::{Duration, Time};
use std::sync::RwLock;
use tokio::sync::oneshot;

struct PendingSleep {
    target: Time,
    done: oneshot::Sender<()>,
}

struct SimState {
    initialized: bool,
    value: Time,
    sleeps: Vec<PendingSleep>,
}

pub(crate) struct SimClock {
    enabled: bool,
    state: RwLock<SimState>,
}

impl SimClock {
    pub(crate) fn new(enabled: bool) -> Self {
        SimClock {
            enabled,
            state: RwLock::new(SimState {
                initialized: false,
                value: Time::default(),
                sleeps: Vec::new(),
            }),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    /// Current time: wall clock when disabled, last `/clock` value otherwise.
    pub(crate) fn now(&self) -> Time {
        if !self.enabled {
            return std::time::SystemTime::now().into();
        }
        self.state.read().unwrap().value
    }

    /// The `/clock` callback body.
    ///
    /// The first tick also rewrites every sleep that was registered before the
    /// clock started: a pre-initialization target is an offset from the epoch,
    /// and becomes the same offset from the first tick, so the sleep still runs
    /// for its requested span of simulated time.
    pub(crate) fn clock_update(&self, tick: Time) {
        let mut state = self.state.write().unwrap();
        if !state.initialized {
            state.initialized = true;
            let epoch = Time::default();
            for sleep in &mut state.sleeps {
                sleep.target = tick + (sleep.target - epoch);
            }
        }
        state.value = tick;

        // Single pass, releasing satisfied sleeps in registration order
        let mut index = 0;
        while index < state.sleeps.len() {
            if state.sleeps[index].target <= state.value {
                let sleep = state.sleeps.remove(index);
                let _ = sleep.done.send(());
            } else {
                index += 1;
            }
        }
    }

    /// Registers a sleep ending `duration` of simulated time from now.
    ///
    /// Returns None when the simulated clock is disabled, in which case the
    /// caller should sleep against the wall clock instead. A target that has
    /// already been surpassed completes immediately.
    pub(crate) fn register_sleep(&self, duration: Duration) -> Option<oneshot::Receiver<()>> {
        if !self.enabled {
            return None;
        }
        let mut state = self.state.write().unwrap();
        let base = if state.initialized {
            state.value
        } else {
            Time::default()
        };
        let target = base + duration;
        let (done, receiver) = oneshot::channel();
        if state.initialized && target <= state.value {
            let _ = done.send(());
        } else {
            state.sleeps.push(PendingSleep { target, done });
        }
        Some(receiver)
    }

    /// Drops every pending sleep so their waiters observe cancellation.
    pub(crate) fn close(&self) {
        let mut state = self.state.write().unwrap();
        if !state.sleeps.is_empty() {
            debug!("Cancelling {} pending simulated sleeps", state.sleeps.len());
        }
        state.sleeps.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_clock_delegates_to_wall_time() {
        let clock = SimClock::new(false);
        assert!(clock.register_sleep(Duration::from_secs(1)).is_none());
        assert!(clock.now() > Time::default());
    }

    #[test]
    fn sleep_releases_when_target_reached() {
        let clock = SimClock::new(true);
        clock.clock_update(Time::new(10, 0));
        let mut rx = clock.register_sleep(Duration::from_secs(5)).unwrap();
        clock.clock_update(Time::new(14, 0));
        assert!(rx.try_recv().is_err());
        clock.clock_update(Time::new(15, 0));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn sleep_already_satisfied_completes_immediately() {
        let clock = SimClock::new(true);
        clock.clock_update(Time::new(10, 0));
        let mut rx = clock.register_sleep(Duration::new(0, 0)).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn preinit_sleep_is_rebased_on_first_tick() {
        let clock = SimClock::new(true);
        // Sleep for 5s of simulated time before any clock message
        let mut rx = clock.register_sleep(Duration::from_secs(5)).unwrap();
        // First tick at t=10: the sleep target becomes 15, not 5
        clock.clock_update(Time::new(10, 0));
        assert!(rx.try_recv().is_err());
        clock.clock_update(Time::new(14, 999_999_999));
        assert!(rx.try_recv().is_err());
        clock.clock_update(Time::new(15, 0));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn sleeps_release_in_registration_order() {
        let clock = SimClock::new(true);
        clock.clock_update(Time::new(0, 0));
        let mut first = clock.register_sleep(Duration::from_secs(3)).unwrap();
        let mut second = clock.register_sleep(Duration::from_secs(1)).unwrap();
        clock.clock_update(Time::new(2, 0));
        assert!(first.try_recv().is_err());
        assert!(second.try_recv().is_ok());
        clock.clock_update(Time::new(3, 0));
        assert!(first.try_recv().is_ok());
    }

    #[test]
    fn close_cancels_pending_sleeps() {
        let clock = SimClock::new(true);
        let mut rx = clock.register_sleep(Duration::from_secs(5)).unwrap();
        clock.close();
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
