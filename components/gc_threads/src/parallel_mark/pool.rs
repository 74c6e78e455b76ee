//! Helper thread pool and the builder/marker wait protocols.
//!
//! Both wait/notify pairs are made of manual-reset events and the mark lock:
//! a waiter resets its event while holding the lock, releases the lock, and
//! waits; a notifier sets the event while holding the lock. Because the
//! reset happens under the lock, a notification can never fall between the
//! condition check and the wait.

use super::event::Event;
use super::mark_lock::{MarkLock, MarkLockGuard};
use crate::collector::MarkEngine;
use crate::platform::Platform;
use core_types::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

thread_local! {
    static MARKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

fn current_marker() -> Option<usize> {
    MARKER_INDEX.with(Cell::get)
}

/// Stack bounds published by a helper thread.
///
/// Helpers hold live mark-stack state on their own stacks, so those stacks
/// are known to the collector just like mutator stacks.
#[derive(Debug)]
pub struct MarkerStack {
    stack_end: AtomicUsize,
    last_stack_min: AtomicUsize,
}

impl MarkerStack {
    fn new() -> Self {
        MarkerStack {
            stack_end: AtomicUsize::new(0),
            last_stack_min: AtomicUsize::new(Address::LIMIT.as_usize()),
        }
    }

    /// Cold end of the helper's stack (null before the helper started).
    pub fn stack_end(&self) -> Address {
        Address::new(self.stack_end.load(Ordering::Acquire))
    }

    /// Cached lowest known address, [`Address::LIMIT`] if unknown.
    pub fn last_stack_min(&self) -> Address {
        Address::new(self.last_stack_min.load(Ordering::Acquire))
    }

    pub(crate) fn set_last_stack_min(&self, min: Address) {
        self.last_stack_min.store(min.as_usize(), Ordering::Release);
    }

    fn publish(&self, end: Address) {
        self.last_stack_min
            .store(Address::LIMIT.as_usize(), Ordering::Relaxed);
        self.stack_end.store(end.as_usize(), Ordering::Release);
    }

    fn withdraw(&self) {
        self.stack_end.store(0, Ordering::Release);
    }
}

/// Coordinates the primary collector thread with its helpers.
///
/// The counters below are only modified with the mark lock held; they are
/// atomics so that diagnostics can read them without it.
pub struct MarkCoordinator {
    lock: MarkLock,
    builder_count: AtomicI64,
    mark_no: AtomicU64,
    help_wanted: AtomicBool,
    helper_count: AtomicUsize,
    shutdown: AtomicBool,
    parallel: AtomicBool,
    helpers: AtomicUsize,
    builder_cv: Event,
    mark_cv: Event,
    helper_cv: Box<[Event]>,
    stacks: Box<[MarkerStack]>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MarkCoordinator {
    /// Creates a coordinator able to run up to `max_helpers` helpers.
    pub fn new(max_helpers: usize) -> Self {
        MarkCoordinator {
            lock: MarkLock::new(),
            builder_count: AtomicI64::new(0),
            mark_no: AtomicU64::new(0),
            help_wanted: AtomicBool::new(false),
            helper_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            parallel: AtomicBool::new(false),
            helpers: AtomicUsize::new(0),
            builder_cv: Event::manual_reset(),
            mark_cv: Event::manual_reset(),
            helper_cv: (0..max_helpers).map(|_| Event::manual_reset()).collect(),
            stacks: (0..max_helpers).map(|_| MarkerStack::new()).collect(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Starts up to `count` helpers and waits until each has published its
    /// stack. Returns the number actually started.
    ///
    /// A helper that cannot be created stops further creation; marking
    /// continues with the helpers that exist.
    pub fn start(
        self: &Arc<Self>,
        count: usize,
        engine: Arc<dyn MarkEngine>,
        platform: Arc<dyn Platform>,
    ) -> usize {
        let count = count.min(self.helper_cv.len());
        if count == 0 || self.parallel.load(Ordering::Acquire) {
            return self.helpers();
        }
        debug_assert_eq!(self.builder_count.load(Ordering::Relaxed), 0);

        let mut started = 0;
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let coordinator = Arc::clone(self);
            let engine = Arc::clone(&engine);
            let platform = Arc::clone(&platform);
            let spawned = thread::Builder::new()
                .name(format!("gc-marker-{index}"))
                .spawn(move || coordinator.helper_main(index, &*engine, &*platform));
            match spawned {
                Ok(handle) => {
                    handles.push(handle);
                    started += 1;
                }
                Err(err) => {
                    warn!("Marker thread {index} creation failed: {err}");
                    break;
                }
            }
        }
        self.handles.lock().extend(handles);
        self.helpers.store(started, Ordering::Release);
        self.wait_for_markers_init(started);
        self.parallel.store(started > 0, Ordering::Release);
        info!("Started {started} mark helper threads");
        started
    }

    fn wait_for_markers_init(&self, count: usize) {
        if count == 0 {
            return;
        }
        {
            let _guard = self.lock.lock();
            // Helpers may already have decremented below zero.
            self.builder_count
                .fetch_add(count as i64, Ordering::Relaxed);
        }
        self.wait_for_reclaim();
    }

    fn helper_main(&self, index: usize, engine: &dyn MarkEngine, platform: &dyn Platform) {
        MARKER_INDEX.with(|cell| cell.set(Some(index)));
        self.stacks[index].publish(platform.approximate_sp());

        self.lock.acquire();
        if self.builder_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.notify_all_builder();
        }
        self.lock.release();

        let mut my_mark_no: u64 = 0;
        loop {
            let global = self.mark_no.load(Ordering::Acquire);
            if my_mark_no.wrapping_sub(global) > 2 {
                my_mark_no = global;
            }
            if !self.help_marker(my_mark_no, engine) {
                break;
            }
            my_mark_no = my_mark_no.wrapping_add(1);
        }
        self.stacks[index].withdraw();
        debug!("mark helper {index} exiting");
    }

    /// One helper round for generation `my_mark_no`. Returns false on shutdown.
    fn help_marker(&self, my_mark_no: u64, engine: &dyn MarkEngine) -> bool {
        self.lock.acquire();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.lock.release();
                return false;
            }
            let mark_no = self.mark_no.load(Ordering::Relaxed);
            let help_wanted = self.help_wanted.load(Ordering::Relaxed);
            if mark_no < my_mark_no || (!help_wanted && mark_no == my_mark_no) {
                self.wait_marker();
            } else {
                break;
            }
        }
        let my_id = self.helper_count.load(Ordering::Relaxed);
        if self.mark_no.load(Ordering::Relaxed) != my_mark_no || my_id > self.helpers() {
            self.lock.release();
            return true;
        }
        self.helper_count.store(my_id + 1, Ordering::Relaxed);
        self.lock.release();

        engine.perform_bounded_mark_work(my_id, my_mark_no);
        self.finish_local_mark();
        true
    }

    fn finish_local_mark(&self) {
        self.lock.acquire();
        if self.helper_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.notify_all_marker();
        }
        self.lock.release();
    }

    /// Runs one parallel mark phase from the primary collector thread.
    ///
    /// Raises `help_wanted`, does the primary's own share, waits for every
    /// helper that joined to finish, then advances the mark generation.
    pub fn do_parallel_mark(&self, engine: &dyn MarkEngine) {
        self.lock.acquire();
        debug_assert!(!self.help_wanted.load(Ordering::Relaxed));
        debug_assert_eq!(self.helper_count.load(Ordering::Relaxed), 0);
        let generation = self.mark_no.load(Ordering::Relaxed);
        self.helper_count.store(1, Ordering::Relaxed);
        self.help_wanted.store(true, Ordering::Relaxed);
        self.notify_all_marker();
        self.lock.release();

        engine.perform_bounded_mark_work(0, generation);
        self.finish_local_mark();

        self.lock.acquire();
        self.help_wanted.store(false, Ordering::Relaxed);
        while self.helper_count.load(Ordering::Relaxed) > 0 {
            self.wait_marker();
        }
        self.mark_no.fetch_add(1, Ordering::Release);
        self.notify_all_marker();
        self.lock.release();
    }

    /// Waits, with the mark lock held on entry and exit, for a marker
    /// notification.
    fn wait_marker(&self) {
        let event = match current_marker() {
            Some(index) if index < self.helper_cv.len() => &self.helper_cv[index],
            _ => &self.mark_cv,
        };
        event.reset();
        self.lock.release();
        event.wait();
        self.lock.acquire();
    }

    /// Wakes every parked helper. Requires the mark lock.
    fn notify_all_marker(&self) {
        let me = current_marker();
        for index in 0..self.helpers().min(self.helper_cv.len()) {
            if Some(index) == me {
                self.mark_cv.set();
            } else {
                self.helper_cv[index].set();
            }
        }
        self.mark_cv.set();
    }

    /// Wakes every thread waiting in [`wait_for_reclaim`](Self::wait_for_reclaim).
    /// Requires the mark lock and a zero builder count.
    fn notify_all_builder(&self) {
        debug_assert!(self.lock.is_locked());
        self.builder_cv.set();
    }

    /// Waits until no free-list builders are outstanding.
    pub fn wait_for_reclaim(&self) {
        loop {
            self.lock.acquire();
            if self.builder_count.load(Ordering::Relaxed) <= 0 {
                break;
            }
            self.builder_cv.reset();
            self.lock.release();
            self.builder_cv.wait();
        }
        self.lock.release();
    }

    /// Registers `count` outstanding free-list builders.
    pub fn add_builders(&self, count: usize) {
        let _guard = self.lock.lock();
        self.builder_count
            .fetch_add(count as i64, Ordering::Relaxed);
    }

    /// Marks one builder done; the last one notifies waiting threads.
    pub fn builder_done(&self) {
        let _guard = self.lock.lock();
        if self.builder_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.notify_all_builder();
        }
    }

    /// Outstanding free-list builders.
    pub fn builder_count(&self) -> i64 {
        self.builder_count.load(Ordering::Acquire)
    }

    /// Current mark generation.
    pub fn mark_generation(&self) -> u64 {
        self.mark_no.load(Ordering::Acquire)
    }

    /// Number of running helpers.
    pub fn helpers(&self) -> usize {
        self.helpers.load(Ordering::Acquire)
    }

    /// Whether parallel marking is active.
    pub fn is_parallel(&self) -> bool {
        self.parallel.load(Ordering::Acquire)
    }

    /// Acquires the mark lock.
    pub fn lock(&self) -> MarkLockGuard<'_> {
        self.lock.lock()
    }

    pub(crate) fn mark_lock(&self) -> &MarkLock {
        &self.lock
    }

    /// Published helper stacks.
    pub fn marker_stacks(&self) -> impl Iterator<Item = &MarkerStack> {
        self.stacks[..self.helpers().min(self.stacks.len())]
            .iter()
            .filter(|s| !s.stack_end().is_null())
    }

    /// Forgets the helpers without waiting for them, as after a fork where
    /// they no longer exist. Parallel marking stays off afterwards.
    pub(crate) fn abandon_helpers(&self) {
        self.parallel.store(false, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
        self.notify_all_marker();
        self.helpers.store(0, Ordering::Release);
        for stack in self.stacks.iter() {
            stack.withdraw();
        }
        self.handles.lock().clear();
    }

    /// Stops and joins every helper.
    pub fn shutdown(&self) {
        {
            let _guard = self.lock.lock();
            self.shutdown.store(true, Ordering::Release);
            self.parallel.store(false, Ordering::Release);
            self.notify_all_marker();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("mark helper panicked");
            }
        }
        self.helpers.store(0, Ordering::Release);
    }
}
