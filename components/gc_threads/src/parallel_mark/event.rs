//! Waitable events, the one low-level primitive the mark coordinator builds on.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A binary event.
///
/// An auto-reset event releases one waiter per [`set`](Event::set) and
/// clears itself; a manual-reset event stays signalled, releasing every
/// waiter, until [`reset`](Event::reset).
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
    manual_reset: bool,
}

impl Event {
    /// Creates an unsignalled auto-reset event.
    pub fn auto_reset() -> Self {
        Self::with_mode(false)
    }

    /// Creates an unsignalled manual-reset event.
    pub fn manual_reset() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(manual_reset: bool) -> Self {
        Event {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            manual_reset,
        }
    }

    /// Signals the event.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        if self.manual_reset {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    /// Clears the event.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Returns true if signalled.
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Blocks until signalled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        if !self.manual_reset {
            *signaled = false;
        }
    }

    /// Blocks until signalled or `timeout` elapses. Returns true if signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.cond.wait_for(&mut signaled, timeout);
        }
        let was_set = *signaled;
        if was_set && !self.manual_reset {
            *signaled = false;
        }
        was_set
    }
}
