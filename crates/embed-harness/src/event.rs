//! A manual-reset waitable event.
//!
//! Once signaled, the event stays signaled and releases every current and
//! future waiter until [`ManualResetEvent::reset`] is called.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct ManualResetEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl ManualResetEvent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts the event in the signaled state and wakes all waiters.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_all();
    }

    /// Returns the event to the non-signaled state.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    ///
    /// Returns true if the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }

    /// Waits for the signal and clears it while still holding the lock, so no
    /// other waiter can observe the same release.
    pub(crate) fn wait_and_reset(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }

    pub(crate) fn wait_and_reset_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.condvar.wait_until(&mut signaled, deadline).timed_out() && !*signaled {
                return false;
            }
        }
        *signaled = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn stays_signaled_until_reset() {
        let event = ManualResetEvent::new();
        event.signal();
        event.wait();
        event.wait();
        assert!(event.is_signaled());

        event.reset();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wakes_waiter_on_other_thread() {
        let event = Arc::new(ManualResetEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        event.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_and_reset_consumes_release() {
        let event = ManualResetEvent::new();
        event.signal();
        event.wait_and_reset();
        assert!(!event.is_signaled());
        assert!(!event.wait_and_reset_timeout(Duration::from_millis(10)));
    }
}
