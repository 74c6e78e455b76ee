//! Stop-the-world control.
//!
//! The collector stops every registered mutator except itself, reads each
//! one's register context, and later resumes them. Threads inside a
//! blocking call are skipped; their saved stack pointer is enough to scan
//! them.

use crate::config::RegistryMode;
use crate::descriptor::{ThreadDescriptor, ThreadFlags};
use crate::error::{or_abort, ThreadError, ThreadResult};
use crate::lock::AllocationGuard;
use crate::registry::ThreadRegistry;
use core_types::{Address, OsHandle};
use crossbeam::utils::CachePadded;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

/// Phase of the stop-the-world cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldPhase {
    /// Mutators run.
    Running,
    /// Threads are being suspended.
    Stopping,
    /// Every eligible thread is suspended.
    Stopped,
    /// Threads are being resumed.
    Resuming,
}

impl WorldPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorldPhase::Stopping,
            2 => WorldPhase::Stopped,
            3 => WorldPhase::Resuming,
            _ => WorldPhase::Running,
        }
    }
}

/// Notification about a thread the controller suspended or resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadEvent {
    /// The thread was suspended.
    Suspended(OsHandle),
    /// The thread was resumed.
    Unsuspended(OsHandle),
}

/// Callback invoked for every [`ThreadEvent`].
pub type ThreadEventCallback = Box<dyn Fn(ThreadEvent) + Send + Sync>;

/// Flags shared between the collector and attaching threads.
pub(crate) struct WorldState {
    phase: AtomicU8,
    please_stop: CachePadded<AtomicBool>,
    attached_while_stopped: CachePadded<AtomicBool>,
}

impl WorldState {
    pub(crate) fn new() -> Self {
        WorldState {
            phase: AtomicU8::new(WorldPhase::Running as u8),
            please_stop: CachePadded::new(AtomicBool::new(false)),
            attached_while_stopped: CachePadded::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn phase(&self) -> WorldPhase {
        WorldPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: WorldPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.please_stop.load(Ordering::SeqCst)
    }

    pub(crate) fn note_attach(&self) {
        self.attached_while_stopped.store(true, Ordering::SeqCst);
    }
}

impl ThreadRegistry {
    /// Current stop-the-world phase.
    pub fn world_phase(&self) -> WorldPhase {
        self.world.phase()
    }

    /// Installs (or removes) the suspend/resume notification callback.
    pub fn set_thread_event_callback(&self, callback: Option<ThreadEventCallback>) {
        *self.event_callback.write() = callback;
    }

    fn fire(&self, event: ThreadEvent) {
        if let Some(callback) = self.event_callback.read().as_ref() {
            callback(event);
        }
    }

    /// Suspends every registered thread except the caller. Fatal errors
    /// abort the process.
    pub fn stop_world(&self, guard: &AllocationGuard<'_>) {
        or_abort(self.try_stop_world(guard));
    }

    /// [`stop_world`](Self::stop_world), returning errors instead of
    /// aborting. On error some threads may remain suspended; call
    /// [`try_start_world`](Self::try_start_world) to release them.
    pub fn try_stop_world(&self, _guard: &AllocationGuard<'_>) -> ThreadResult<()> {
        debug_assert_eq!(self.world.phase(), WorldPhase::Running);
        self.world.set_phase(WorldPhase::Stopping);

        // Helpers hold no descriptors; the mark lock keeps them out of the
        // builder bookkeeping while the world is stopped.
        let _mark = self.markers.is_parallel().then(|| {
            let guard = self.markers.lock();
            debug_assert_eq!(self.markers.builder_count(), 0);
            guard
        });

        self.world.please_stop.store(true, Ordering::SeqCst);
        if self.mode() == RegistryMode::Discovery {
            self.world
                .attached_while_stopped
                .store(false, Ordering::SeqCst);
        }

        let me = self.platform.current_thread_id();
        let skip = match self.mode() {
            RegistryMode::Discovery => ThreadFlags::BLOCKING,
            RegistryMode::Explicit => ThreadFlags::BLOCKING | ThreadFlags::FINISHED,
        };
        let mut stopped = 0usize;
        for descriptor in self.store.snapshot() {
            if descriptor.stack_end().is_null()
                || descriptor.id() == me
                || descriptor.flags().intersects(skip)
            {
                continue;
            }
            if self.suspend_thread(&descriptor)? {
                stopped += 1;
            }
        }
        self.world.set_phase(WorldPhase::Stopped);
        debug!("World stopped ({stopped} threads suspended)");
        Ok(())
    }

    /// Suspends one thread and captures its context. Returns false if the
    /// thread turned out to have exited.
    fn suspend_thread(&self, descriptor: &Arc<ThreadDescriptor>) -> ThreadResult<bool> {
        self.store.note_mutation(descriptor);
        let handle = descriptor.handle();
        let limit = self.config.suspend_retry_limit;
        let mut attempts: u32 = 0;
        loop {
            if self.platform.has_exited(handle) {
                trace!("Thread {} exited before it could be suspended", descriptor.id());
                match self.mode() {
                    RegistryMode::Discovery => self.retire(descriptor),
                    RegistryMode::Explicit => descriptor.set_stack_end(Address::NULL),
                }
                return Ok(false);
            }
            if self.platform.suspend(handle) {
                match self.platform.get_context(handle) {
                    Ok(context) => {
                        descriptor.set_saved_context(context);
                        break;
                    }
                    Err(_) => {
                        if !self.platform.resume(handle) {
                            return Err(ThreadError::ResumeFailed(descriptor.id()));
                        }
                    }
                }
            }
            if attempts > 1 {
                thread::yield_now();
            }
            attempts += 1;
            if attempts >= limit {
                return Err(ThreadError::SuspendRetriesExhausted {
                    thread: descriptor.id(),
                    attempts,
                });
            }
        }
        descriptor.insert_flags(ThreadFlags::SUSPENDED);
        trace!("Suspended thread {}", descriptor.id());
        self.fire(ThreadEvent::Suspended(handle));
        Ok(true)
    }

    /// Resumes every thread suspended by [`stop_world`](Self::stop_world).
    /// Fatal errors abort the process.
    pub fn start_world(&self, guard: &AllocationGuard<'_>) {
        or_abort(self.try_start_world(guard));
    }

    /// [`start_world`](Self::start_world), returning errors instead of
    /// aborting.
    pub fn try_start_world(&self, _guard: &AllocationGuard<'_>) -> ThreadResult<()> {
        self.world.set_phase(WorldPhase::Resuming);
        let me = self.platform.current_thread_id();
        for descriptor in self.store.snapshot() {
            if !descriptor.has(ThreadFlags::SUSPENDED) {
                continue;
            }
            debug_assert_ne!(descriptor.id(), me);
            let handle = descriptor.handle();
            if !self.platform.resume(handle) {
                return Err(ThreadError::ResumeFailed(descriptor.id()));
            }
            self.store.note_mutation(&descriptor);
            descriptor.remove_flags(ThreadFlags::SUSPENDED);
            self.fire(ThreadEvent::Unsuspended(handle));
        }
        self.world.please_stop.store(false, Ordering::SeqCst);
        self.world.set_phase(WorldPhase::Running);
        debug!("World started");
        Ok(())
    }

    /// Returns true (once) if a thread attached while the world was being
    /// stopped, in which case the collector must restart its mark phase.
    /// Always false in explicit mode.
    pub fn started_thread_while_stopped(&self) -> bool {
        if self.mode() != RegistryMode::Discovery {
            return false;
        }
        self.world
            .attached_while_stopped
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Takes the allocation lock and stops the world. The world restarts
    /// and the lock is released when the returned guard is dropped.
    pub fn stop_the_world(&self) -> WorldStopped<'_> {
        let guard = self.lock();
        self.stop_world(&guard);
        WorldStopped {
            registry: self,
            guard,
        }
    }
}

/// A stopped world. Resumes every suspended thread on drop.
pub struct WorldStopped<'a> {
    registry: &'a ThreadRegistry,
    guard: AllocationGuard<'a>,
}

impl<'a> WorldStopped<'a> {
    /// The allocation lock held for the duration of the stop.
    pub fn guard(&self) -> &AllocationGuard<'a> {
        &self.guard
    }

    /// Pushes every registered stack as roots.
    pub fn push_all_stacks(&self) -> usize {
        self.registry.push_all_stacks(&self.guard)
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        self.registry.start_world(&self.guard);
    }
}
