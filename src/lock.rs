//! Binary gate over device open/close transitions.
//!
//! Unlike a mutex guard, the slot is not tied to the acquiring thread: an
//! open acquires it on the background context and the platform's "opened"
//! callback path releases it.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Single-slot mutual exclusion over the device handle.
#[derive(Debug, Default)]
pub struct ExclusiveDeviceLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl ExclusiveDeviceLock {
    /// Create an unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the slot is free, then take it.
    pub fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
        trace!("device lock acquired");
    }

    /// Take the slot, waiting at most `timeout`. Returns whether it was taken.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while *held {
            if self.released.wait_until(&mut held, deadline).timed_out() {
                return false;
            }
        }
        *held = true;
        trace!("device lock acquired");
        true
    }

    /// Free the slot. Safe to call when it is not held.
    pub fn release(&self) {
        let mut held = self.held.lock();
        if *held {
            *held = false;
            self.released.notify_one();
            trace!("device lock released");
        }
    }

    /// Whether the slot is currently taken.
    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }
}
