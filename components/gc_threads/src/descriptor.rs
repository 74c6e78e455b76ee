//! Per-thread records.
//!
//! A [`ThreadDescriptor`] is shared between its owning thread (which reports
//! blocking transitions and stack growth), the stop-the-world controller
//! (suspension state) and the registration manager (retirement). Fields that
//! other threads read are atomics: writers publish with `Release`, readers
//! use `Acquire`. Descriptors live behind `Arc`, so a handle stays valid
//! however the store reorganises its containers.

use crate::arch::RegisterContext;
use crate::collector::InternalBlock;
use bitflags::bitflags;
use core_types::{Address, OsHandle, ThreadKey};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

bitflags! {
    /// Thread state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadFlags: u8 {
        /// Stopped by the stop-the-world controller.
        const SUSPENDED = 1 << 0;
        /// Inside an opaque external call; its saved stack pointer is authoritative.
        const BLOCKING = 1 << 1;
        /// Ran to completion but not reclaimed yet.
        const FINISHED = 1 << 2;
        /// Nobody will join it; reclaim as soon as it finishes.
        const DETACHED = 1 << 3;
    }
}

/// A boundary where the thread left collector-visible code and came back.
///
/// Stack memory between `saved_stack_ptr` (the stack pointer recorded when
/// the thread went blocking) and `boundary` (the frame where it re-entered)
/// belongs to the external call and is not scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracedSection {
    /// Lowest address of the re-entry frame.
    pub boundary: Address,
    /// Stack pointer saved when the thread entered the blocking call.
    pub saved_stack_ptr: Address,
}

/// One registered thread.
pub struct ThreadDescriptor {
    slot: usize,
    in_use: AtomicBool,
    id: AtomicU64,
    handle: AtomicU64,
    stack_end: AtomicUsize,
    last_stack_min: AtomicUsize,
    stack_ptr: AtomicUsize,
    flags: AtomicU8,
    incarnation: AtomicU64,
    context: Mutex<Option<RegisterContext>>,
    sections: Mutex<Vec<TracedSection>>,
    block: Mutex<Option<InternalBlock>>,
}

impl ThreadDescriptor {
    /// An unused descriptor for store slot (or bucket) `slot`.
    pub fn new(slot: usize) -> Self {
        ThreadDescriptor {
            slot,
            in_use: AtomicBool::new(false),
            id: AtomicU64::new(ThreadKey::NONE.0),
            handle: AtomicU64::new(OsHandle::INVALID.0),
            stack_end: AtomicUsize::new(0),
            last_stack_min: AtomicUsize::new(Address::LIMIT.as_usize()),
            stack_ptr: AtomicUsize::new(0),
            flags: AtomicU8::new(0),
            incarnation: AtomicU64::new(0),
            context: Mutex::new(None),
            sections: Mutex::new(Vec::new()),
            block: Mutex::new(None),
        }
    }

    /// (Re)initialises the record for a newly registered thread.
    ///
    /// Bumps the incarnation so holders of an older view can tell the
    /// descriptor now describes someone else.
    pub fn reinitialize(&self, id: ThreadKey, handle: OsHandle, stack_end: Address) {
        self.id.store(id.0, Ordering::Relaxed);
        self.handle.store(handle.0, Ordering::Relaxed);
        self.last_stack_min
            .store(Address::LIMIT.as_usize(), Ordering::Relaxed);
        self.stack_ptr.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        *self.context.lock() = None;
        self.sections.lock().clear();
        self.incarnation.fetch_add(1, Ordering::Relaxed);
        self.stack_end.store(stack_end.as_usize(), Ordering::Release);
    }

    /// Brings a finished descriptor back for its thread, which registered
    /// again with a new handle and stack base. Keeps the other flags.
    pub(crate) fn revive(&self, handle: OsHandle, stack_end: Address) {
        self.set_handle(handle);
        self.last_stack_min
            .store(Address::LIMIT.as_usize(), Ordering::Relaxed);
        self.incarnation.fetch_add(1, Ordering::Relaxed);
        self.stack_end.store(stack_end.as_usize(), Ordering::Release);
        self.remove_flags(ThreadFlags::FINISHED);
    }

    /// Clears the record on retirement. Does not release the slot.
    pub fn clear(&self) {
        self.stack_end.store(0, Ordering::Relaxed);
        self.id.store(ThreadKey::NONE.0, Ordering::Relaxed);
        self.handle.store(OsHandle::INVALID.0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        *self.context.lock() = None;
        self.sections.lock().clear();
    }

    /// Store slot (array backend) or bucket index (hash backend).
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Claims the slot. Returns true if it was free.
    pub(crate) fn try_claim(&self) -> bool {
        !self.in_use.swap(true, Ordering::AcqRel)
    }

    /// Publishes the slot as free.
    pub(crate) fn release_slot(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// Whether the slot is claimed.
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Thread identifier.
    pub fn id(&self) -> ThreadKey {
        ThreadKey(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, id: ThreadKey) {
        self.id.store(id.0, Ordering::Release);
    }

    /// OS handle owned by this descriptor.
    pub fn handle(&self) -> OsHandle {
        OsHandle(self.handle.load(Ordering::Acquire))
    }

    pub(crate) fn set_handle(&self, handle: OsHandle) {
        self.handle.store(handle.0, Ordering::Release);
    }

    /// Cold end of the stack; null means "not a root source".
    pub fn stack_end(&self) -> Address {
        Address::new(self.stack_end.load(Ordering::Acquire))
    }

    pub(crate) fn set_stack_end(&self, end: Address) {
        self.stack_end.store(end.as_usize(), Ordering::Release);
    }

    /// Cached lowest known stack address, [`Address::LIMIT`] if unknown.
    pub fn last_stack_min(&self) -> Address {
        Address::new(self.last_stack_min.load(Ordering::Acquire))
    }

    pub(crate) fn set_last_stack_min(&self, min: Address) {
        self.last_stack_min.store(min.as_usize(), Ordering::Release);
    }

    /// Stack pointer saved on entry to a blocking call.
    pub fn saved_stack_ptr(&self) -> Address {
        Address::new(self.stack_ptr.load(Ordering::Acquire))
    }

    pub(crate) fn set_saved_stack_ptr(&self, sp: Address) {
        self.stack_ptr.store(sp.as_usize(), Ordering::Release);
    }

    /// Current flag set.
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Returns true if every bit of `flags` is set.
    pub fn has(&self, flags: ThreadFlags) -> bool {
        self.flags().contains(flags)
    }

    pub(crate) fn insert_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Generation counter, bumped on every (re)initialisation.
    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::Acquire)
    }

    /// Register snapshot captured while suspended (possibly stale).
    pub fn saved_context(&self) -> Option<RegisterContext> {
        self.context.lock().clone()
    }

    pub(crate) fn set_saved_context(&self, context: RegisterContext) {
        *self.context.lock() = Some(context);
    }

    /// Innermost traced section, if any.
    pub fn innermost_section(&self) -> Option<TracedSection> {
        self.sections.lock().last().copied()
    }

    /// Traced sections, innermost first.
    pub fn traced_sections(&self) -> Vec<TracedSection> {
        self.sections.lock().iter().rev().copied().collect()
    }

    pub(crate) fn push_section(&self, section: TracedSection) {
        self.sections.lock().push(section);
    }

    pub(crate) fn pop_section(&self) -> Option<TracedSection> {
        self.sections.lock().pop()
    }

    pub(crate) fn block(&self) -> Option<InternalBlock> {
        *self.block.lock()
    }

    pub(crate) fn set_block(&self, block: Option<InternalBlock>) {
        *self.block.lock() = block;
    }
}

impl fmt::Debug for ThreadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadDescriptor")
            .field("slot", &self.slot)
            .field("id", &self.id())
            .field("stack_end", &self.stack_end())
            .field("last_stack_min", &self.last_stack_min())
            .field("flags", &self.flags())
            .field("incarnation", &self.incarnation())
            .finish()
    }
}
