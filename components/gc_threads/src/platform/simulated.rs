//! Deterministic platform model.
//!
//! Real OS threads are bound to simulated identities with explicit stacks,
//! stack pointers and register values. Suspension only updates bookkeeping,
//! so tests can observe exactly which threads the registry tried to stop.
//! Memory is a set of regions mapped by the test.

use super::{ContextUnavailable, MemoryRegion, Platform, Protection};
use crate::arch::{host_table, RegisterContext};
use core_types::{approximate_sp, Address, OsHandle, StackBase, ThreadKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::thread::ThreadId;

const AUTO_KEY_BASE: u64 = 1 << 40;

#[derive(Debug, Default, Clone)]
struct SimThread {
    stack_base: Option<StackBase>,
    sp: Option<Address>,
    registers: Vec<(String, usize)>,
    suspend_count: u32,
    suspend_calls: u64,
    exited: bool,
    context_failures: u32,
    suspend_failures: u32,
}

#[derive(Default)]
struct SimState {
    bindings: HashMap<ThreadId, ThreadKey>,
    threads: HashMap<ThreadKey, SimThread>,
    handles: HashMap<OsHandle, ThreadKey>,
    regions: BTreeMap<Address, MemoryRegion>,
    next_handle: u64,
    next_auto_key: u64,
    fail_handle_duplication: bool,
}

impl SimState {
    fn current_key(&mut self) -> ThreadKey {
        let id = std::thread::current().id();
        if let Some(key) = self.bindings.get(&id) {
            return *key;
        }
        self.next_auto_key += 1;
        let key = ThreadKey(AUTO_KEY_BASE + self.next_auto_key);
        self.bindings.insert(id, key);
        self.threads.entry(key).or_default();
        key
    }

    fn thread_for(&mut self, handle: OsHandle) -> Option<&mut SimThread> {
        let key = *self.handles.get(&handle)?;
        self.threads.get_mut(&key)
    }
}

/// A simulated platform. Cheap to create; every test builds its own.
pub struct SimulatedPlatform {
    state: Mutex<SimState>,
    page_size: usize,
    cpus: usize,
}

impl SimulatedPlatform {
    /// Creates an empty model reporting `cpus` processors.
    pub fn new(cpus: usize) -> Self {
        SimulatedPlatform {
            state: Mutex::new(SimState::default()),
            page_size: 4096,
            cpus,
        }
    }

    /// Gives the calling OS thread the identity `key`, with a stack whose
    /// cold end is `stack_end` and whose current stack pointer is `sp`.
    pub fn bind_current(&self, key: ThreadKey, stack_end: Address, sp: Address) {
        let mut state = self.state.lock();
        state.bindings.insert(std::thread::current().id(), key);
        let thread = state.threads.entry(key).or_default();
        thread.stack_base = Some(StackBase::new(stack_end));
        thread.sp = Some(sp);
        thread.exited = false;
    }

    /// Maps a stack of `size` bytes ending at `stack_end`, with a guard page
    /// below it. Returns the lowest stack address.
    pub fn map_stack(&self, stack_end: Address, size: usize) -> Address {
        let low = stack_end.sub(size);
        self.map_region(low, size, Protection::READ | Protection::WRITE);
        self.map_region(
            low.sub(self.page_size),
            self.page_size,
            Protection::READ | Protection::WRITE | Protection::GUARD,
        );
        low
    }

    /// Maps one region, replacing any region with the same base.
    pub fn map_region(&self, base: Address, size: usize, protection: Protection) {
        self.state.lock().regions.insert(
            base,
            MemoryRegion {
                base,
                size,
                protection,
            },
        );
    }

    /// Moves the stack pointer of a simulated thread.
    pub fn set_sp(&self, key: ThreadKey, sp: Address) {
        self.state.lock().threads.entry(key).or_default().sp = Some(sp);
    }

    /// Sets a register value reported in the thread's context.
    pub fn set_register(&self, key: ThreadKey, name: &str, value: usize) {
        let mut state = self.state.lock();
        let thread = state.threads.entry(key).or_default();
        thread.registers.retain(|(n, _)| n != name);
        thread.registers.push((name.to_string(), value));
    }

    /// Marks a thread as terminated.
    pub fn mark_exited(&self, key: ThreadKey) {
        self.state.lock().threads.entry(key).or_default().exited = true;
    }

    /// Makes the next `count` context queries for `key` fail.
    pub fn fail_context(&self, key: ThreadKey, count: u32) {
        self.state.lock().threads.entry(key).or_default().context_failures = count;
    }

    /// Makes the next `count` suspend calls for `key` fail.
    pub fn fail_suspend(&self, key: ThreadKey, count: u32) {
        self.state.lock().threads.entry(key).or_default().suspend_failures = count;
    }

    /// Makes handle duplication fail (or succeed again).
    pub fn fail_handle_duplication(&self, fail: bool) {
        self.state.lock().fail_handle_duplication = fail;
    }

    /// Returns true while `key` has outstanding suspensions.
    pub fn is_suspended(&self, key: ThreadKey) -> bool {
        self.state
            .lock()
            .threads
            .get(&key)
            .is_some_and(|t| t.suspend_count > 0)
    }

    /// Total suspend calls made against `key`.
    pub fn suspend_calls(&self, key: ThreadKey) -> u64 {
        self.state
            .lock()
            .threads
            .get(&key)
            .map_or(0, |t| t.suspend_calls)
    }

    /// Number of handles not yet closed.
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }
}

impl Platform for SimulatedPlatform {
    fn current_thread_id(&self) -> ThreadKey {
        self.state.lock().current_key()
    }

    fn duplicate_current_handle(&self) -> Option<OsHandle> {
        let mut state = self.state.lock();
        if state.fail_handle_duplication {
            return None;
        }
        let key = state.current_key();
        state.next_handle += 1;
        let handle = OsHandle(state.next_handle);
        state.handles.insert(handle, key);
        Some(handle)
    }

    fn close_handle(&self, handle: OsHandle) {
        self.state.lock().handles.remove(&handle);
    }

    fn has_exited(&self, handle: OsHandle) -> bool {
        self.state
            .lock()
            .thread_for(handle)
            .map_or(true, |t| t.exited)
    }

    fn suspend(&self, handle: OsHandle) -> bool {
        let mut state = self.state.lock();
        let Some(thread) = state.thread_for(handle) else {
            return false;
        };
        thread.suspend_calls += 1;
        if thread.suspend_failures > 0 {
            thread.suspend_failures -= 1;
            return false;
        }
        thread.suspend_count += 1;
        true
    }

    fn resume(&self, handle: OsHandle) -> bool {
        let mut state = self.state.lock();
        match state.thread_for(handle) {
            Some(thread) if thread.suspend_count > 0 => {
                thread.suspend_count -= 1;
                true
            }
            _ => false,
        }
    }

    fn get_context(&self, handle: OsHandle) -> Result<RegisterContext, ContextUnavailable> {
        let mut state = self.state.lock();
        let thread = state.thread_for(handle).ok_or(ContextUnavailable)?;
        if thread.exited {
            return Err(ContextUnavailable);
        }
        if thread.context_failures > 0 {
            thread.context_failures -= 1;
            return Err(ContextUnavailable);
        }
        let sp = thread.sp.ok_or(ContextUnavailable)?;
        let mut context = RegisterContext::new(host_table(), sp);
        for (name, value) in &thread.registers {
            context.set(name, *value);
        }
        Ok(context)
    }

    fn query_region(&self, addr: Address) -> Option<MemoryRegion> {
        let state = self.state.lock();
        let (_, region) = state.regions.range(..=addr).next_back()?;
        region.contains(addr).then_some(*region)
    }

    fn approximate_sp(&self) -> Address {
        let mut state = self.state.lock();
        let key = state.current_key();
        state
            .threads
            .get(&key)
            .and_then(|t| t.sp)
            .unwrap_or_else(approximate_sp)
    }

    fn current_stack_base(&self) -> Option<StackBase> {
        let mut state = self.state.lock();
        let key = state.current_key();
        state.threads.get(&key).and_then(|t| t.stack_base)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }
}
