//! Native threads stopped with signals.
//!
//! Suspending a thread sends it `SIGPWR` with `pthread_kill`. The
//! handler copies the interrupted registers out of the `ucontext_t` the
//! kernel hands it, acknowledges, and waits in `sigsuspend` until the
//! controller sends `SIGXCPU`. The target needs no cooperation: a
//! loop that never allocates or calls into the registry stops just the same.
//!
//! The handler only touches atomics and async-signal-safe libc calls. While
//! the world is stopped the controller must not wait for locks a mutator may
//! hold; the platform's own tables are only locked with the suspend signal
//! blocked, so no thread is ever stopped inside them.
//!
//! Stack bounds come from `pthread_getattr_np`, read once per thread on the
//! thread itself.

use super::{ContextUnavailable, MemoryRegion, Platform, Protection};
use crate::arch::{host_table, RegisterContext};
use core_types::{approximate_sp, Address, OsHandle, StackBase, ThreadKey};
use crossbeam::utils::Backoff;
use log::{error, trace, warn};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use std::{mem, ptr, thread};

/// Stops a thread.
const SUSPEND_SIGNAL: libc::c_int = libc::SIGPWR;

/// Lets a stopped thread continue.
const RESUME_SIGNAL: libc::c_int = libc::SIGXCPU;

const RUNNING: u8 = 0;
const REQUESTED: u8 = 1;
const STOPPED: u8 = 2;

const SAVED_WORDS: usize = 32;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

/// Stacks of every thread that has touched the platform, by low address.
static STACKS: Mutex<BTreeMap<usize, StackBounds>> = Mutex::new(BTreeMap::new());

#[derive(Debug, Clone, Copy)]
struct StackBounds {
    lo: usize,
    hi: usize,
    guard: usize,
}

impl StackBounds {
    fn of_current_thread() -> Option<Self> {
        // SAFETY: the attribute object is initialised by pthread_getattr_np
        // and destroyed before it goes out of scope.
        unsafe {
            let mut attr: libc::pthread_attr_t = mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return None;
            }
            let mut addr: *mut libc::c_void = ptr::null_mut();
            let mut size: libc::size_t = 0;
            let mut guard: libc::size_t = 0;
            let found = libc::pthread_attr_getstack(&attr, &mut addr, &mut size) == 0;
            if libc::pthread_attr_getguardsize(&attr, &mut guard) != 0 {
                guard = 0;
            }
            libc::pthread_attr_destroy(&mut attr);
            (found && !addr.is_null()).then(|| StackBounds {
                lo: addr as usize,
                hi: addr as usize + size,
                guard,
            })
        }
    }
}

/// Keeps the suspend signal blocked on the calling thread while alive, so
/// the thread is never stopped holding one of this module's locks.
struct SuspendBlocked {
    previous: libc::sigset_t,
}

impl SuspendBlocked {
    fn new() -> Self {
        // SAFETY: plain signal mask manipulation on the calling thread.
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            let mut previous: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, SUSPEND_SIGNAL);
            libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut previous);
            SuspendBlocked { previous }
        }
    }
}

impl Drop for SuspendBlocked {
    fn drop(&mut self) {
        // SAFETY: restores the mask saved by `new` on the same thread.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
        }
    }
}

/// Registers of a stopped thread, written from the signal handler.
struct SavedFrame {
    sp: AtomicUsize,
    words: [AtomicUsize; SAVED_WORDS],
}

impl SavedFrame {
    fn new() -> Self {
        SavedFrame {
            sp: AtomicUsize::new(0),
            words: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    fn to_context(&self) -> RegisterContext {
        let table = host_table();
        let mut context = RegisterContext::new(table, Address::new(self.sp.load(Ordering::Acquire)));
        for (name, word) in table.registers.iter().zip(&self.words) {
            context.set(name, word.load(Ordering::Relaxed));
        }
        context
    }
}

struct NativeThread {
    key: ThreadKey,
    pthread: libc::pthread_t,
    stack: Option<StackBounds>,
    state: AtomicU8,
    resume_requested: AtomicBool,
    exited: AtomicBool,
    frame: SavedFrame,
    /// Outstanding suspensions. Held while signalling so the thread cannot
    /// finish exiting under a `pthread_kill`.
    suspend_count: Mutex<u32>,
}

impl NativeThread {
    fn wait_while(&self, timeout: Duration, mut pending: impl FnMut(u8) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        while pending(self.state.load(Ordering::Acquire)) {
            if self.exited.load(Ordering::Acquire) || Instant::now() >= deadline {
                return false;
            }
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
        true
    }
}

thread_local! {
    static CURRENT: ThreadSlot = ThreadSlot::attach();
    static SIGNAL_TARGET: Cell<*const NativeThread> = const { Cell::new(ptr::null()) };
}

/// Owns the calling thread's record; marks it exited on thread-local teardown.
struct ThreadSlot(Arc<NativeThread>);

impl ThreadSlot {
    fn attach() -> Self {
        let stack = StackBounds::of_current_thread();
        let thread = Arc::new(NativeThread {
            key: ThreadKey(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed)),
            // SAFETY: always succeeds.
            pthread: unsafe { libc::pthread_self() },
            stack,
            state: AtomicU8::new(RUNNING),
            resume_requested: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            frame: SavedFrame::new(),
            suspend_count: Mutex::new(0),
        });
        if let Some(bounds) = stack {
            let _blocked = SuspendBlocked::new();
            STACKS.lock().insert(bounds.lo, bounds);
        }
        SIGNAL_TARGET.with(|target| target.set(Arc::as_ptr(&thread)));
        ThreadSlot(thread)
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        // A stop arriving from here on stays pending until the thread is gone.
        mem::forget(SuspendBlocked::new());
        {
            let _count = self.0.suspend_count.lock();
            self.0.exited.store(true, Ordering::Release);
        }
        let _ = SIGNAL_TARGET.try_with(|target| target.set(ptr::null()));
        if let Some(bounds) = self.0.stack {
            STACKS.lock().remove(&bounds.lo);
        }
    }
}

fn current_thread() -> Option<Arc<NativeThread>> {
    CURRENT.try_with(|slot| Arc::clone(&slot.0)).ok()
}

#[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64"))]
unsafe fn record_frame(frame: &SavedFrame, context: *mut libc::c_void) {
    // Order of the x86_64 register table.
    const GREGS: [libc::c_int; 15] = [
        libc::REG_RAX,
        libc::REG_RCX,
        libc::REG_RDX,
        libc::REG_RBX,
        libc::REG_RBP,
        libc::REG_RSI,
        libc::REG_RDI,
        libc::REG_R8,
        libc::REG_R9,
        libc::REG_R10,
        libc::REG_R11,
        libc::REG_R12,
        libc::REG_R13,
        libc::REG_R14,
        libc::REG_R15,
    ];
    let gregs = &(*(context as *const libc::ucontext_t)).uc_mcontext.gregs;
    for (word, reg) in frame.words.iter().zip(GREGS) {
        word.store(gregs[reg as usize] as usize, Ordering::Relaxed);
    }
    frame
        .sp
        .store(gregs[libc::REG_RSP as usize] as usize, Ordering::Release);
}

#[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "aarch64"))]
unsafe fn record_frame(frame: &SavedFrame, context: *mut libc::c_void) {
    let mcontext = &(*(context as *const libc::ucontext_t)).uc_mcontext;
    // x0..x28, then lr (x30).
    let regs = mcontext.regs[..29].iter().chain(&mcontext.regs[30..31]);
    for (word, value) in frame.words.iter().zip(regs) {
        word.store(*value as usize, Ordering::Relaxed);
    }
    frame.sp.store(mcontext.sp as usize, Ordering::Release);
}

/// The kernel saved the interrupted registers on this very stack, so a scan
/// starting at the handler frame still covers them.
#[cfg(not(all(
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
unsafe fn record_frame(frame: &SavedFrame, _context: *mut libc::c_void) {
    frame
        .sp
        .store(approximate_sp().as_usize(), Ordering::Release);
}

extern "C" fn suspend_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let target = SIGNAL_TARGET.try_with(Cell::get).unwrap_or(ptr::null());
    if target.is_null() {
        return;
    }
    // SAFETY: the slot keeps the record alive and clears the pointer (with
    // this signal blocked) before releasing it.
    let thread = unsafe { &*target };
    if thread.state.load(Ordering::SeqCst) != REQUESTED {
        return;
    }
    // SAFETY: errno is thread-local; it is restored before returning.
    let errno = unsafe { *libc::__errno_location() };
    // SAFETY: `context` is the ucontext_t the kernel passed to an
    // SA_SIGINFO handler.
    unsafe { record_frame(&thread.frame, context) };
    thread.state.store(STOPPED, Ordering::SeqCst);

    // SAFETY: sigsuspend atomically unblocks only the resume signal, which
    // stays blocked (and pending) everywhere else in this handler.
    unsafe {
        let mut wait_mask: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&mut wait_mask);
        libc::sigdelset(&mut wait_mask, RESUME_SIGNAL);
        while !thread.resume_requested.load(Ordering::SeqCst) {
            libc::sigsuspend(&wait_mask);
        }
    }
    let _ = thread
        .state
        .compare_exchange(STOPPED, RUNNING, Ordering::SeqCst, Ordering::SeqCst);
    // SAFETY: see above.
    unsafe { *libc::__errno_location() = errno };
}

extern "C" fn resume_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
}

/// Installs `handler` for `signal`, keeping `blocked` masked while it runs.
unsafe fn install_handler(signal: libc::c_int, handler: usize, blocked: Option<libc::c_int>) -> bool {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    if let Some(blocked) = blocked {
        libc::sigaddset(&mut action.sa_mask, blocked);
    }
    libc::sigaction(signal, &action, ptr::null_mut()) == 0
}

fn signals_installed() -> bool {
    static INSTALLED: OnceLock<bool> = OnceLock::new();
    *INSTALLED.get_or_init(|| {
        // SAFETY: both handlers are async-signal-safe and installed once per
        // process.
        let installed = unsafe {
            install_handler(
                SUSPEND_SIGNAL,
                suspend_handler as usize,
                Some(RESUME_SIGNAL),
            ) && install_handler(RESUME_SIGNAL, resume_handler as usize, None)
        };
        if !installed {
            error!("Failed to install thread suspension signal handlers");
        }
        installed
    })
}

/// Platform backed by real OS threads.
pub struct NativePlatform {
    handles: Mutex<HashMap<OsHandle, Arc<NativeThread>>>,
    next_handle: AtomicU64,
    ack_timeout: Duration,
    signals: bool,
}

impl NativePlatform {
    /// Creates the platform, installing the suspend and resume handlers on
    /// first use.
    pub fn new() -> Self {
        NativePlatform {
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            ack_timeout: Duration::from_secs(1),
            signals: signals_installed(),
        }
    }

    fn with_handles<R>(&self, f: impl FnOnce(&mut HashMap<OsHandle, Arc<NativeThread>>) -> R) -> R {
        let _blocked = SuspendBlocked::new();
        f(&mut self.handles.lock())
    }

    fn thread(&self, handle: OsHandle) -> Option<Arc<NativeThread>> {
        self.with_handles(|handles| handles.get(&handle).cloned())
    }

    /// Number of handles not yet closed.
    pub fn open_handles(&self) -> usize {
        self.with_handles(|handles| handles.len())
    }
}

impl Default for NativePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for NativePlatform {
    fn current_thread_id(&self) -> ThreadKey {
        current_thread().map_or(ThreadKey::NONE, |t| t.key)
    }

    fn duplicate_current_handle(&self) -> Option<OsHandle> {
        let thread = current_thread()?;
        let handle = OsHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.with_handles(|handles| handles.insert(handle, thread));
        Some(handle)
    }

    fn close_handle(&self, handle: OsHandle) {
        self.with_handles(|handles| handles.remove(&handle));
    }

    fn has_exited(&self, handle: OsHandle) -> bool {
        self.thread(handle)
            .map_or(true, |t| t.exited.load(Ordering::Acquire))
    }

    fn suspend(&self, handle: OsHandle) -> bool {
        let Some(thread) = self.thread(handle) else {
            return false;
        };
        if !self.signals {
            return false;
        }
        {
            let mut count = thread.suspend_count.lock();
            if thread.exited.load(Ordering::Acquire) {
                return false;
            }
            *count += 1;
            if *count > 1 {
                return true;
            }
            thread.resume_requested.store(false, Ordering::SeqCst);
            thread.state.store(REQUESTED, Ordering::SeqCst);
            // SAFETY: the thread has not passed its exit hook (checked under
            // the count lock it takes there), so its pthread_t is live.
            let rc = unsafe { libc::pthread_kill(thread.pthread, SUSPEND_SIGNAL) };
            if rc != 0 {
                warn!("pthread_kill failed for thread {}: error {rc}", thread.key);
                *count -= 1;
                thread.state.store(RUNNING, Ordering::SeqCst);
                return false;
            }
        }
        if !thread.wait_while(self.ack_timeout, |state| state != STOPPED) {
            trace!("Thread {} has not acknowledged its suspension yet", thread.key);
        }
        true
    }

    fn resume(&self, handle: OsHandle) -> bool {
        let Some(thread) = self.thread(handle) else {
            return false;
        };
        {
            let mut count = thread.suspend_count.lock();
            if *count == 0 {
                return false;
            }
            *count -= 1;
            if *count > 0 {
                return true;
            }
            thread.resume_requested.store(true, Ordering::SeqCst);
            if thread.exited.load(Ordering::Acquire) {
                thread.state.store(RUNNING, Ordering::SeqCst);
                return true;
            }
            // SAFETY: as in `suspend`.
            let rc = unsafe { libc::pthread_kill(thread.pthread, RESUME_SIGNAL) };
            if rc != 0 {
                warn!("pthread_kill failed for thread {}: error {rc}", thread.key);
                return false;
            }
        }
        thread.wait_while(self.ack_timeout, |state| state == STOPPED);
        true
    }

    fn get_context(&self, handle: OsHandle) -> Result<RegisterContext, ContextUnavailable> {
        let thread = self.thread(handle).ok_or(ContextUnavailable)?;
        if thread.state.load(Ordering::Acquire) != STOPPED {
            return Err(ContextUnavailable);
        }
        Ok(thread.frame.to_context())
    }

    fn query_region(&self, addr: Address) -> Option<MemoryRegion> {
        let raw = addr.as_usize();
        let _blocked = SuspendBlocked::new();
        let stacks = STACKS.lock();
        if let Some((_, bounds)) = stacks.range(..=raw).next_back() {
            if raw < bounds.hi {
                return Some(MemoryRegion {
                    base: Address::new(bounds.lo),
                    size: bounds.hi - bounds.lo,
                    protection: Protection::READ | Protection::WRITE,
                });
            }
        }
        let (_, above) = stacks.range(raw + 1..).next()?;
        let guard_base = above.lo.saturating_sub(above.guard);
        (above.guard > 0 && raw >= guard_base).then(|| MemoryRegion {
            base: Address::new(guard_base),
            size: above.guard,
            protection: Protection::GUARD,
        })
    }

    fn approximate_sp(&self) -> Address {
        approximate_sp()
    }

    fn current_stack_base(&self) -> Option<StackBase> {
        let bounds = current_thread()?.stack?;
        Some(StackBase::new(Address::new(bounds.hi)))
    }

    fn page_size(&self) -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
    }
}
