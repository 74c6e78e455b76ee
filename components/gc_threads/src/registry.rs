//! Thread registration and lifecycle.
//!
//! [`ThreadRegistry`] is the process-wide context object: it owns the
//! descriptor store, the allocation lock, the world state and the marker
//! pool. World control, stack scanning and fork handling live in their own
//! modules as further `impl ThreadRegistry` blocks.

use crate::collector::{CountingAllocator, InternalAllocator, MarkEngine};
use crate::config::{RegistryMode, ThreadsConfig};
use crate::descriptor::{ThreadDescriptor, ThreadFlags, TracedSection};
use crate::error::{escalate, or_abort, RegisterStatus, ThreadError, ThreadResult};
use crate::lock::{AllocationGuard, AllocationLock};
use crate::parallel_mark::MarkCoordinator;
use crate::platform::Platform;
use crate::stack_scan::RegionCache;
use crate::stop_world::{ThreadEventCallback, WorldState};
use crate::store::{FixedArrayStore, HashTableStore, ThreadStore};
use core_types::{with_stack_base, Address, StackBase, ThreadKey};
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Registry of every thread whose stack the collector scans.
pub struct ThreadRegistry {
    pub(crate) config: ThreadsConfig,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) engine: Arc<dyn MarkEngine>,
    pub(crate) store: Box<dyn ThreadStore>,
    pub(crate) alloc_lock: AllocationLock,
    pub(crate) world: WorldState,
    pub(crate) markers: Arc<MarkCoordinator>,
    pub(crate) regions: RegionCache,
    pub(crate) in_thread_creation: AtomicBool,
    pub(crate) event_callback: RwLock<Option<ThreadEventCallback>>,
    pub(crate) total_stack_size: AtomicUsize,
    registration_allowed: AtomicBool,
    marker_count: AtomicUsize,
}

impl ThreadRegistry {
    /// Builds a registry and registers the calling thread as the first
    /// (primary) thread.
    ///
    /// The caller's stack base comes from the platform; use
    /// [`init_with`](Self::init_with) when the platform cannot tell.
    pub fn init(
        config: ThreadsConfig,
        platform: Arc<dyn Platform>,
        engine: Arc<dyn MarkEngine>,
    ) -> ThreadResult<Arc<Self>> {
        Self::init_with(config, platform, engine, Arc::new(CountingAllocator::new()), None)
    }

    /// Builds a registry with an explicit descriptor allocator and,
    /// optionally, an explicit stack base for the calling thread.
    pub fn init_with(
        config: ThreadsConfig,
        platform: Arc<dyn Platform>,
        engine: Arc<dyn MarkEngine>,
        allocator: Arc<dyn InternalAllocator>,
        stack_base: Option<StackBase>,
    ) -> ThreadResult<Arc<Self>> {
        let store: Box<dyn ThreadStore> = match config.mode {
            RegistryMode::Explicit => Box::new(HashTableStore::new(config.table_size, allocator)),
            RegistryMode::Discovery => Box::new(FixedArrayStore::new(config.max_threads)),
        };
        let markers = Arc::new(MarkCoordinator::new(config.max_markers.saturating_sub(1)));
        let marker_count = config.resolve_marker_count(platform.cpu_count());
        if config.mode == RegistryMode::Discovery {
            info!("Parallel marking is unavailable with implicit thread discovery");
        } else if marker_count <= 1 {
            info!("Single marker thread, turning off parallel marking");
        } else {
            debug!("Using {marker_count} marker threads");
        }
        let registry = Arc::new(ThreadRegistry {
            config,
            platform,
            engine,
            store,
            alloc_lock: AllocationLock::new(),
            world: WorldState::new(),
            markers,
            regions: RegionCache::new(),
            in_thread_creation: AtomicBool::new(false),
            event_callback: RwLock::new(None),
            total_stack_size: AtomicUsize::new(0),
            registration_allowed: AtomicBool::new(false),
            marker_count: AtomicUsize::new(marker_count),
        });

        let me = registry.platform.current_thread_id();
        let base = stack_base
            .or_else(|| registry.platform.current_stack_base())
            .ok_or(ThreadError::BadStackBase(me))?;
        {
            let _guard = registry.lock();
            registry.register_inner(base)?;
        }
        info!(
            "Thread registry initialised ({} store, primary thread {me})",
            registry.store.name()
        );
        Ok(registry)
    }

    /// Acquires the allocation lock.
    pub fn lock(&self) -> AllocationGuard<'_> {
        self.alloc_lock.lock(&*self.platform)
    }

    /// Configuration the registry was built with.
    pub fn config(&self) -> &ThreadsConfig {
        &self.config
    }

    /// Registration mode.
    pub fn mode(&self) -> RegistryMode {
        self.config.mode
    }

    /// Platform the registry talks to.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// The mark engine roots are pushed into.
    pub fn engine(&self) -> &Arc<dyn MarkEngine> {
        &self.engine
    }

    /// The parallel mark coordinator.
    pub fn markers(&self) -> &Arc<MarkCoordinator> {
        &self.markers
    }

    /// Descriptor for `id`, finished or not.
    pub fn descriptor(&self, id: ThreadKey) -> Option<Arc<ThreadDescriptor>> {
        self.store.lookup(id)
    }

    /// Every descriptor currently in the store.
    pub fn descriptors(&self) -> Vec<Arc<ThreadDescriptor>> {
        self.store.snapshot()
    }

    /// Number of registered threads that have not finished.
    pub fn live_threads(&self) -> usize {
        self.store.live_count()
    }

    /// Bytes of stack pushed by the last complete root push.
    pub fn total_stack_size(&self) -> usize {
        self.total_stack_size.load(Ordering::Relaxed)
    }

    fn current(&self) -> ThreadResult<Arc<ThreadDescriptor>> {
        let me = self.platform.current_thread_id();
        self.store
            .lookup(me)
            .filter(|d| !d.has(ThreadFlags::FINISHED))
            .ok_or(ThreadError::NotRegistered(me))
    }

    /// Installs a descriptor for the calling thread.
    ///
    /// Explicit mode requires the allocation lock; discovery mode must not
    /// take it.
    pub(crate) fn register_inner(&self, base: StackBase) -> ThreadResult<Arc<ThreadDescriptor>> {
        let me = self.platform.current_thread_id();
        if base.is_null() {
            return Err(ThreadError::BadStackBase(me));
        }
        let handle = self
            .platform
            .duplicate_current_handle()
            .ok_or(ThreadError::HandleDuplication(me))?;
        let descriptor = match self.store.register(me, handle, base.mem_base) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.platform.close_handle(handle);
                return Err(err);
            }
        };
        if self.mode() == RegistryMode::Discovery && self.world.is_stop_requested() {
            self.world.note_attach();
        }
        debug!("Registered thread {me} (stack end {})", base.mem_base);
        Ok(descriptor)
    }

    /// Enables explicit registration and starts the marker helpers.
    ///
    /// Must be called by a registered thread before any other thread
    /// registers itself with [`register_current_thread`](Self::register_current_thread).
    pub fn allow_register_threads(&self) {
        debug_assert!(
            self.current().is_ok(),
            "allow_register_threads called from an unregistered thread"
        );
        self.start_mark_threads();
        self.registration_allowed.store(true, Ordering::Release);
    }

    /// Sets the total marker count (primary included) used when helpers
    /// start. Has no effect once they are running.
    pub fn set_marker_thread_count(&self, markers: usize) {
        if self.markers.is_parallel() {
            warn!("Marker threads already started; ignoring marker count {markers}");
            return;
        }
        self.marker_count
            .store(markers.max(1).min(self.config.max_markers), Ordering::Relaxed);
    }

    /// Starts the marker helpers if parallel marking applies and they are
    /// not running yet. Returns the number of helpers.
    pub fn start_mark_threads(&self) -> usize {
        if self.markers.is_parallel() {
            return self.markers.helpers();
        }
        let count = self
            .config
            .helpers_for(self.marker_count.load(Ordering::Relaxed));
        self.markers.start(
            count,
            Arc::clone(&self.engine),
            Arc::clone(&self.platform),
        )
    }

    /// Registers the calling thread with `base` as its stack base.
    ///
    /// Re-registering a finished thread revives its descriptor; registering
    /// a live one again returns [`RegisterStatus::Duplicate`]. Fatal errors
    /// abort.
    pub fn register_current_thread(&self, base: StackBase) -> ThreadResult<RegisterStatus> {
        escalate(self.try_register_current_thread(base))
    }

    /// [`register_current_thread`](Self::register_current_thread) without
    /// the abort on fatal errors.
    pub fn try_register_current_thread(&self, base: StackBase) -> ThreadResult<RegisterStatus> {
        let me = self.platform.current_thread_id();
        if self.mode() == RegistryMode::Discovery {
            if self.store.lookup(me).is_some() {
                return Ok(RegisterStatus::Duplicate);
            }
            self.register_inner(base)?;
            return Ok(RegisterStatus::Success);
        }
        if !self.registration_allowed.load(Ordering::Acquire) {
            return Err(ThreadError::RegistrationNotAllowed);
        }
        let _guard = self.lock();
        match self.store.lookup(me) {
            None => {
                self.register_inner(base)?;
                Ok(RegisterStatus::Success)
            }
            Some(descriptor) if descriptor.has(ThreadFlags::FINISHED) => {
                if base.is_null() {
                    return Err(ThreadError::BadStackBase(me));
                }
                let handle = self
                    .platform
                    .duplicate_current_handle()
                    .ok_or(ThreadError::HandleDuplication(me))?;
                self.platform.close_handle(descriptor.handle());
                self.store.note_mutation(&descriptor);
                descriptor.revive(handle, base.mem_base);
                debug!("Revived descriptor of thread {me}");
                Ok(RegisterStatus::Success)
            }
            Some(_) => Ok(RegisterStatus::Duplicate),
        }
    }

    /// Unregisters the calling thread.
    ///
    /// In explicit mode the descriptor stays in the store as FINISHED until
    /// the thread is joined, unless it was detached. Waits for an
    /// in-progress incremental collection cycle first so that objects the
    /// thread allocated are not lost.
    pub fn unregister_current_thread(&self) -> ThreadResult<()> {
        let me = self.platform.current_thread_id();
        if self.mode() == RegistryMode::Discovery {
            self.delete_thread(me);
            return Ok(());
        }
        let mut guard = self.lock();
        self.wait_for_gc_completion(&mut guard, false);
        let descriptor = self
            .store
            .lookup(me)
            .filter(|d| !d.has(ThreadFlags::FINISHED))
            .ok_or(ThreadError::NotRegistered(me))?;
        if descriptor.has(ThreadFlags::DETACHED) {
            self.retire(&descriptor);
        } else {
            self.store.note_mutation(&descriptor);
            descriptor.insert_flags(ThreadFlags::FINISHED);
        }
        debug!("Unregistered thread {me}");
        Ok(())
    }

    /// Returns true if the calling thread has a live descriptor.
    pub fn is_current_thread_registered(&self) -> bool {
        let _guard = self.lock();
        self.current().is_ok()
    }

    /// Closes the descriptor's handle and removes it from the store.
    /// Explicit mode requires the allocation lock.
    pub(crate) fn retire(&self, descriptor: &Arc<ThreadDescriptor>) {
        trace!("Retiring thread {}", descriptor.id());
        self.platform.close_handle(descriptor.handle());
        self.store.unlink(descriptor);
    }

    fn delete_thread(&self, id: ThreadKey) {
        match self.store.lookup(id) {
            Some(descriptor) => self.retire(&descriptor),
            None => warn!("Removing nonexistent thread {id}"),
        }
    }

    /// Drives an in-progress incremental collection forward until it ends
    /// (`wait_for_all`) or until at least one cycle completes.
    pub fn wait_for_gc_completion(&self, guard: &mut AllocationGuard<'_>, wait_for_all: bool) {
        if !self.engine.is_collection_in_progress() {
            return;
        }
        let start = self.engine.gc_number();
        loop {
            self.in_thread_creation.store(true, Ordering::Relaxed);
            self.engine.collect_a_little();
            self.in_thread_creation.store(false, Ordering::Relaxed);
            guard.unlocked(thread::yield_now);
            if !self.engine.is_collection_in_progress()
                || (!wait_for_all && self.engine.gc_number() != start)
            {
                break;
            }
        }
    }

    /// Runs `f` as a blocking call: the collector will not suspend the
    /// calling thread and scans its stack only above the stack pointer
    /// saved here.
    ///
    /// `f` must not touch collected memory unless it re-enters through
    /// [`call_with_gc_active`](Self::call_with_gc_active).
    pub fn enter_blocking_call<R>(&self, f: impl FnOnce() -> R) -> ThreadResult<R> {
        let descriptor = self.current()?;
        let _scope = self.begin_blocking(descriptor);
        Ok(f())
    }

    fn begin_blocking(&self, descriptor: Arc<ThreadDescriptor>) -> BlockingScope<'_> {
        let _guard = self.lock();
        debug_assert!(!descriptor.has(ThreadFlags::BLOCKING));
        self.store.note_mutation(&descriptor);
        descriptor.set_saved_stack_ptr(self.platform.approximate_sp());
        descriptor.insert_flags(ThreadFlags::BLOCKING);
        BlockingScope {
            registry: self,
            descriptor,
        }
    }

    /// Runs `f` with the calling thread collector-visible again, from inside
    /// a blocking call.
    ///
    /// The stack between the blocking call's saved stack pointer and this
    /// frame is skipped when scanning. Values that `f` needs to keep alive
    /// must be reachable from frames `f` itself creates.
    pub fn call_with_gc_active<R>(&self, f: impl FnOnce() -> R) -> ThreadResult<R> {
        let descriptor = self.current()?;
        let frame = self.platform.approximate_sp();
        let guard = self.lock();
        if descriptor.stack_end() < frame {
            self.store.note_mutation(&descriptor);
            descriptor.set_stack_end(frame);
            descriptor.set_last_stack_min(Address::LIMIT);
        }
        if !descriptor.has(ThreadFlags::BLOCKING) {
            drop(guard);
            return Ok(f());
        }
        self.store.note_mutation(&descriptor);
        descriptor.push_section(TracedSection {
            boundary: frame,
            saved_stack_ptr: descriptor.saved_stack_ptr(),
        });
        descriptor.remove_flags(ThreadFlags::BLOCKING);
        drop(guard);

        let _scope = ActiveScope {
            registry: self,
            descriptor,
        };
        Ok(f())
    }

    /// Resets the stack base of `descriptor` (the calling thread when
    /// `None`), for example after switching to a different stack.
    pub fn set_stack_bottom(
        &self,
        descriptor: Option<&Arc<ThreadDescriptor>>,
        base: StackBase,
    ) -> ThreadResult<()> {
        let _guard = self.lock();
        let descriptor = match descriptor {
            Some(d) => Arc::clone(d),
            None => self.current()?,
        };
        debug_assert!(!descriptor.has(ThreadFlags::BLOCKING));
        debug_assert!(descriptor.innermost_section().is_none());
        self.store.note_mutation(&descriptor);
        descriptor.set_stack_end(base.mem_base);
        descriptor.set_last_stack_min(Address::LIMIT);
        Ok(())
    }

    /// Stack base of the calling thread, with its descriptor.
    pub fn get_my_stack_bottom(&self) -> ThreadResult<(StackBase, Arc<ThreadDescriptor>)> {
        let _guard = self.lock();
        let descriptor = self.current()?;
        Ok((StackBase::new(descriptor.stack_end()), descriptor))
    }

    /// Spawns a thread that is registered for its whole lifetime.
    pub fn spawn<F, T>(self: &Arc<Self>, f: F) -> ThreadResult<RegisteredJoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(thread::Builder::new(), f)
    }

    /// [`spawn`](Self::spawn) with a caller-configured builder.
    ///
    /// The child registers before `f` runs and unregisters when `f` returns
    /// or unwinds.
    pub fn spawn_with<F, T>(
        self: &Arc<Self>,
        builder: thread::Builder,
        f: F,
    ) -> ThreadResult<RegisteredJoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.mode() == RegistryMode::Explicit {
            self.start_mark_threads();
        }
        let state = Arc::new(Mutex::new(SpawnState::default()));
        let registry = Arc::clone(self);
        let child_state = Arc::clone(&state);
        let inner = builder.spawn(move || {
            let known_base = registry.platform.current_stack_base();
            with_stack_base(move |frame_base| {
                let base = known_base.unwrap_or(frame_base);
                let _token = registry.register_spawned(base, &child_state);
                f()
            })
        })?;
        Ok(RegisteredJoinHandle {
            registry: Arc::clone(self),
            inner: Some(inner),
            state,
        })
    }

    fn register_spawned(&self, base: StackBase, state: &Mutex<SpawnState>) -> RegistrationToken<'_> {
        let descriptor = match self.mode() {
            RegistryMode::Explicit => {
                let _guard = self.lock();
                or_abort(self.register_inner(base))
            }
            RegistryMode::Discovery => or_abort(self.register_inner(base)),
        };
        let mut state = state.lock();
        if state.detached {
            descriptor.insert_flags(ThreadFlags::DETACHED);
        }
        state.descriptor = Some((Arc::clone(&descriptor), descriptor.incarnation()));
        RegistrationToken { registry: self }
    }

    /// Retires a spawned thread's descriptor after join or detach, if it
    /// still describes the same incarnation.
    fn reclaim_spawned(&self, state: &mut SpawnState, detach: bool) {
        state.detached |= detach;
        let Some((descriptor, incarnation)) = state.descriptor.take() else {
            return;
        };
        if self.mode() == RegistryMode::Discovery {
            return;
        }
        let _guard = self.lock();
        if descriptor.incarnation() != incarnation || !descriptor.is_in_use() {
            return;
        }
        if descriptor.has(ThreadFlags::FINISHED) {
            self.retire(&descriptor);
        } else if detach {
            self.store.note_mutation(&descriptor);
            descriptor.insert_flags(ThreadFlags::DETACHED);
        }
    }

    /// Discovery mode: the OS reports a new thread.
    pub fn on_thread_attach(&self, base: StackBase) -> RegisterStatus {
        debug_assert_eq!(self.mode(), RegistryMode::Discovery);
        let me = self.platform.current_thread_id();
        if self.store.lookup(me).is_some() {
            return RegisterStatus::Duplicate;
        }
        or_abort(self.register_inner(base));
        RegisterStatus::Success
    }

    /// Discovery mode: the OS reports that the calling thread is exiting.
    pub fn on_thread_detach(&self) {
        debug_assert_eq!(self.mode(), RegistryMode::Discovery);
        self.delete_thread(self.platform.current_thread_id());
    }

    /// Discovery mode: the process is unloading; forgets every thread.
    pub fn on_process_detach(&self) {
        for descriptor in self.store.snapshot() {
            self.retire(&descriptor);
        }
        info!("Released all thread descriptors");
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        self.markers.shutdown();
        for descriptor in self.store.snapshot() {
            self.platform.close_handle(descriptor.handle());
            self.store.unlink(&descriptor);
        }
    }
}

struct BlockingScope<'a> {
    registry: &'a ThreadRegistry,
    descriptor: Arc<ThreadDescriptor>,
}

impl Drop for BlockingScope<'_> {
    fn drop(&mut self) {
        let _guard = self.registry.lock();
        self.registry.store.note_mutation(&self.descriptor);
        self.descriptor.remove_flags(ThreadFlags::BLOCKING);
    }
}

struct ActiveScope<'a> {
    registry: &'a ThreadRegistry,
    descriptor: Arc<ThreadDescriptor>,
}

impl Drop for ActiveScope<'_> {
    fn drop(&mut self) {
        let _guard = self.registry.lock();
        self.registry.store.note_mutation(&self.descriptor);
        if let Some(section) = self.descriptor.pop_section() {
            self.descriptor.set_saved_stack_ptr(section.saved_stack_ptr);
        }
        self.descriptor.insert_flags(ThreadFlags::BLOCKING);
    }
}

/// Unregisters the spawned thread when dropped, including during unwinding.
struct RegistrationToken<'a> {
    registry: &'a ThreadRegistry,
}

impl Drop for RegistrationToken<'_> {
    fn drop(&mut self) {
        if let Err(err) = escalate(self.registry.unregister_current_thread()) {
            warn!("Spawned thread could not unregister: {err}");
        }
    }
}

#[derive(Default)]
struct SpawnState {
    descriptor: Option<(Arc<ThreadDescriptor>, u64)>,
    detached: bool,
}

/// Join handle for a thread started with [`ThreadRegistry::spawn`].
///
/// Joining reclaims the finished descriptor. Dropping the handle detaches
/// the thread, whose descriptor is then reclaimed as soon as it finishes.
pub struct RegisteredJoinHandle<T> {
    registry: Arc<ThreadRegistry>,
    inner: Option<thread::JoinHandle<T>>,
    state: Arc<Mutex<SpawnState>>,
}

impl<T> RegisteredJoinHandle<T> {
    /// The underlying std thread.
    pub fn thread(&self) -> Option<&thread::Thread> {
        self.inner.as_ref().map(|h| h.thread())
    }

    /// Returns true once the thread has finished running.
    pub fn is_finished(&self) -> bool {
        self.inner.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Waits for the thread to finish and reclaims its descriptor.
    ///
    /// A registered caller waits as a blocking call (unless it already is
    /// in one), so a collection can proceed while it waits.
    pub fn join(mut self) -> thread::Result<T> {
        let Some(inner) = self.inner.take() else {
            return Err(Box::new("thread already joined"));
        };
        let scope = self
            .registry
            .current()
            .ok()
            .filter(|descriptor| !descriptor.has(ThreadFlags::BLOCKING))
            .map(|descriptor| self.registry.begin_blocking(descriptor));
        let result = inner.join();
        drop(scope);
        let mut state = self.state.lock();
        self.registry.reclaim_spawned(&mut state, false);
        result
    }
}

impl<T> Drop for RegisteredJoinHandle<T> {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            let mut state = self.state.lock();
            self.registry.reclaim_spawned(&mut state, true);
        }
    }
}
