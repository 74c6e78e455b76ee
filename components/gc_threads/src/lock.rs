//! The global allocation lock.
//!
//! One lock serialises registry mutation, collection triggering and root
//! pushing. Holding an [`AllocationGuard`] is the proof of ownership that
//! lock-requiring registry operations take as an argument.
//!
//! Contended acquisition spins briefly before parking; the collector holds
//! the lock across a whole stop-the-world, so waiters usually park.

use crate::platform::Platform;
use core_types::ThreadKey;
use crossbeam::utils::Backoff;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// The allocation lock.
pub struct AllocationLock {
    raw: RawMutex,
    holder: AtomicU64,
}

impl AllocationLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        AllocationLock {
            raw: RawMutex::INIT,
            holder: AtomicU64::new(0),
        }
    }

    /// Acquires the lock.
    pub fn lock<'a>(&'a self, platform: &'a dyn Platform) -> AllocationGuard<'a> {
        self.acquire(platform);
        self.set_holder(platform);
        AllocationGuard {
            lock: self,
            platform,
        }
    }

    /// Acquires the lock only if it is free.
    pub fn try_lock<'a>(&'a self, platform: &'a dyn Platform) -> Option<AllocationGuard<'a>> {
        if !self.raw.try_lock() {
            return None;
        }
        self.set_holder(platform);
        Some(AllocationGuard {
            lock: self,
            platform,
        })
    }

    /// Returns true while someone holds the lock.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Thread recorded as holder (debug builds only; `NONE` otherwise).
    pub fn holder(&self) -> ThreadKey {
        ThreadKey(self.holder.load(Ordering::Relaxed))
    }

    fn acquire(&self, platform: &dyn Platform) {
        debug_assert!(
            {
                let me = platform.current_thread_id();
                !self.raw.is_locked() || !me.is_some() || self.holder() != me
            },
            "allocation lock is not reentrant"
        );
        if self.raw.try_lock() {
            return;
        }
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            backoff.snooze();
            if self.raw.try_lock() {
                return;
            }
        }
        self.raw.lock();
    }

    fn set_holder(&self, platform: &dyn Platform) {
        if cfg!(debug_assertions) {
            self.holder
                .store(platform.current_thread_id().0, Ordering::Relaxed);
        }
    }

    fn release(&self) {
        self.holder.store(0, Ordering::Relaxed);
        // SAFETY: only called by the guard that acquired the lock.
        unsafe { self.raw.unlock() };
    }
}

impl Default for AllocationLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the allocation lock is held. Releases it on drop.
pub struct AllocationGuard<'a> {
    lock: &'a AllocationLock,
    platform: &'a dyn Platform,
}

impl<'a> AllocationGuard<'a> {
    /// Temporarily releases the lock around `f`.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.lock.release();
        let result = f();
        self.lock.acquire(self.platform);
        self.lock.set_holder(self.platform);
        result
    }

    pub(crate) fn platform(&self) -> &'a dyn Platform {
        self.platform
    }
}

impl Drop for AllocationGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
