//! Process fork support.
//!
//! Around a fork the registry must be quiescent: the allocation lock and
//! the mark lock are taken before the fork and released in both processes
//! afterwards. In the child only the forking thread survives, so every
//! other descriptor is dropped and marker helpers are forgotten.

use crate::config::RegistryMode;
use crate::descriptor::ThreadDescriptor;
use crate::error::{ThreadError, ThreadResult};
use crate::lock::AllocationGuard;
use crate::registry::ThreadRegistry;
use log::{debug, info};
use std::sync::Arc;

/// Locks held across a fork. Obtained from
/// [`ThreadRegistry::fork_prepare`] and consumed by
/// [`ThreadRegistry::fork_parent`] or [`ThreadRegistry::fork_child`].
#[must_use = "a prepared fork keeps the allocation lock until it is finished"]
pub struct ForkGuard<'a> {
    guard: AllocationGuard<'a>,
    mark_locked: bool,
    forker: Option<Arc<ThreadDescriptor>>,
}

impl ThreadRegistry {
    /// Quiesces the registry before a fork.
    ///
    /// Waits for outstanding free-list builders and any incremental
    /// collection, then keeps the allocation lock (and the mark lock when
    /// parallel marking is on) until the guard is handed back.
    pub fn fork_prepare(&self) -> ThreadResult<ForkGuard<'_>> {
        if self.mode() == RegistryMode::Discovery {
            return Err(ThreadError::ForkUnsupported("threads are discovered implicitly"));
        }
        if !self.config.handle_fork {
            return Err(ThreadError::ForkUnsupported("disabled by configuration"));
        }
        let mut guard = self.lock();
        self.markers.wait_for_reclaim();
        self.wait_for_gc_completion(&mut guard, true);
        let mark_locked = self.markers.is_parallel();
        if mark_locked {
            self.markers.mark_lock().acquire();
        }
        let forker = self.store.lookup(self.platform.current_thread_id());
        debug!("Prepared for fork");
        Ok(ForkGuard {
            guard,
            mark_locked,
            forker,
        })
    }

    /// Releases the fork locks in the parent.
    pub fn fork_parent(&self, fork: ForkGuard<'_>) {
        if fork.mark_locked {
            self.markers.mark_lock().release();
        }
        drop(fork.guard);
    }

    /// Rebuilds the registry in the child: only the forking thread remains,
    /// re-keyed to its new identity and handle, and parallel marking is off.
    pub fn fork_child(&self, fork: ForkGuard<'_>) -> ThreadResult<()> {
        if fork.mark_locked {
            self.markers.mark_lock().release();
        }
        self.markers.abandon_helpers();

        let me = self.platform.current_thread_id();
        let forker = fork.forker.ok_or(ThreadError::NotRegistered(me))?;
        let handle = self
            .platform
            .duplicate_current_handle()
            .ok_or(ThreadError::HandleDuplication(me))?;
        self.store.retain_only(&forker, me);
        // The parent's handle is not valid here; it is not closed.
        forker.set_handle(handle);
        drop(fork.guard);
        info!("Thread registry reset in forked child (thread {me})");
        Ok(())
    }
}
