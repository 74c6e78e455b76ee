//! The mark lock: a three-state word plus an auto-reset event.
//!
//! State 0 is unlocked, 1 locked with no waiters, -1 locked with possible
//! waiters. Only a release that finds -1 has to touch the event.

use super::event::Event;
use std::sync::atomic::{AtomicI32, Ordering};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const LOCKED_CONTENDED: i32 = -1;

/// Lock guarding the parallel-mark bookkeeping.
pub struct MarkLock {
    state: AtomicI32,
    wakeup: Event,
}

impl MarkLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        MarkLock {
            state: AtomicI32::new(UNLOCKED),
            wakeup: Event::auto_reset(),
        }
    }

    /// Acquires the lock, returning a guard.
    pub fn lock(&self) -> MarkLockGuard<'_> {
        self.acquire();
        MarkLockGuard { lock: self }
    }

    /// Returns true while the lock is held.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) != UNLOCKED
    }

    pub(crate) fn acquire(&self) {
        if self.state.swap(LOCKED, Ordering::Acquire) != UNLOCKED {
            while self.state.swap(LOCKED_CONTENDED, Ordering::Acquire) != UNLOCKED {
                self.wakeup.wait();
            }
        }
    }

    pub(crate) fn release(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) < 0 {
            self.wakeup.set();
        }
    }
}

impl Default for MarkLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the mark lock until dropped.
pub struct MarkLockGuard<'a> {
    lock: &'a MarkLock,
}

impl Drop for MarkLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
