//! Conservative root discovery from thread stacks.
//!
//! For every registered thread the scanner determines the live stack range
//! `[sp, stack_end)`, skips the parts that belong to blocking external
//! calls, and hands the remaining ranges (plus saved registers) to the mark
//! engine. The lowest mapped address of each stack is found through the
//! platform's memory queries and cached per descriptor.

use crate::arch::capture_register_roots;
use crate::config::RegistryMode;
use crate::descriptor::{ThreadDescriptor, ThreadFlags, TracedSection};
use crate::error::{or_abort, ThreadError, ThreadResult};
use crate::lock::AllocationGuard;
use crate::parallel_mark::MarkerStack;
use crate::platform::{MemoryRegion, Platform};
use crate::registry::ThreadRegistry;
use core_types::{Address, ThreadKey};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Memory-query helper with a one-entry cache.
pub(crate) struct RegionCache {
    last: Mutex<Option<(Address, Option<MemoryRegion>)>>,
}

impl RegionCache {
    pub(crate) fn new() -> Self {
        RegionCache {
            last: Mutex::new(None),
        }
    }

    pub(crate) fn invalidate(&self) {
        *self.last.lock() = None;
    }

    fn query(&self, platform: &dyn Platform, addr: Address) -> Option<MemoryRegion> {
        let mut last = self.last.lock();
        if let Some((cached, region)) = *last {
            if cached == addr {
                return region;
            }
        }
        let region = platform.query_region(addr);
        *last = Some((addr, region));
        region
    }

    /// The stack-like region containing `addr`, if any.
    pub(crate) fn stack_region(&self, platform: &dyn Platform, addr: Address) -> Option<MemoryRegion> {
        self.query(platform, addr).filter(MemoryRegion::is_stack_like)
    }

    /// Lowest address of the contiguous stack-like mapping that `from`
    /// belongs to (or ends at).
    pub(crate) fn stack_min(&self, platform: &dyn Platform, from: Address) -> Address {
        let mut bottom = match self.stack_region(platform, from) {
            Some(region) => region.base,
            None => from,
        };
        while !bottom.is_null() {
            match self.stack_region(platform, bottom.sub(1)) {
                Some(region) if region.base < bottom => bottom = region.base,
                _ => break,
            }
        }
        bottom
    }
}

/// Whose stack [`ThreadRegistry::get_next_stack`] picked.
enum StackOwner<'a> {
    Thread(Arc<ThreadDescriptor>),
    Marker(&'a MarkerStack),
}

impl StackOwner<'_> {
    fn last_stack_min(&self) -> Address {
        match self {
            StackOwner::Thread(d) => d.last_stack_min(),
            StackOwner::Marker(m) => m.last_stack_min(),
        }
    }

    fn set_last_stack_min(&self, min: Address) {
        match self {
            StackOwner::Thread(d) => d.set_last_stack_min(min),
            StackOwner::Marker(m) => m.set_last_stack_min(min),
        }
    }
}

/// Pushes `[lo, hi)` minus the gaps left by traced sections (innermost
/// first).
fn push_stack_sections(
    registry: &ThreadRegistry,
    mut lo: Address,
    hi: Address,
    sections: &[TracedSection],
) {
    for section in sections {
        debug_assert!(lo <= section.boundary);
        registry.engine.push_root_range(lo, section.boundary);
        lo = section.saved_stack_ptr;
    }
    registry.engine.push_root_range(lo, hi);
}

impl ThreadRegistry {
    /// Pushes the stack (and registers) of every eligible thread. Returns
    /// the number of stack bytes pushed. Fatal errors abort the process.
    ///
    /// Every other thread must be suspended or blocking.
    pub fn push_all_stacks(&self, guard: &AllocationGuard<'_>) -> usize {
        or_abort(self.try_push_all_stacks(guard))
    }

    /// [`push_all_stacks`](Self::push_all_stacks), returning errors instead
    /// of aborting.
    pub fn try_push_all_stacks(&self, _guard: &AllocationGuard<'_>) -> ThreadResult<usize> {
        self.regions.invalidate();
        let me = self.platform.current_thread_id();
        let mut found_me = false;
        let mut total = 0usize;
        let mut pushed = 0usize;
        for descriptor in self.store.snapshot() {
            if descriptor.stack_end().is_null() {
                continue;
            }
            if self.mode() == RegistryMode::Explicit && descriptor.has(ThreadFlags::FINISHED) {
                continue;
            }
            total += self.push_stack_for(&descriptor, me, &mut found_me);
            pushed += 1;
        }
        debug!("Pushed {pushed} thread stacks");
        if !found_me && !self.in_thread_creation.load(Ordering::Relaxed) {
            return Err(ThreadError::UnknownCollector);
        }
        self.total_stack_size.store(total, Ordering::Relaxed);
        Ok(total)
    }

    fn push_stack_for(&self, descriptor: &ThreadDescriptor, me: ThreadKey, found_me: &mut bool) -> usize {
        let stack_end = descriptor.stack_end();
        let is_self = descriptor.id() == me;
        let flags = descriptor.flags();

        let sp = if is_self {
            debug_assert!(!flags.contains(ThreadFlags::BLOCKING));
            *found_me = true;
            self.platform.approximate_sp()
        } else if flags.contains(ThreadFlags::BLOCKING) {
            descriptor.saved_stack_ptr()
        } else {
            let context = if flags.contains(ThreadFlags::SUSPENDED) {
                descriptor.saved_context()
            } else {
                // Not stopped by us: ask for a live context, falling back to
                // the last one captured.
                self.platform
                    .get_context(descriptor.handle())
                    .ok()
                    .or_else(|| descriptor.saved_context())
            };
            let Some(context) = context else {
                warn!("No register context for thread {}, skipping its stack", descriptor.id());
                return 0;
            };
            self.engine.push_root_words(capture_register_roots(&context));
            context.sp()
        };

        let stack_min = self.stack_min_for(descriptor, sp, is_self);
        if sp >= stack_min && sp < stack_end {
            trace!("Pushing stack of thread {} from {sp} to {stack_end}", descriptor.id());
            push_stack_sections(self, sp, stack_end, &descriptor.traced_sections());
        } else {
            // An out-of-range sp of another thread just inside the guard
            // page is expected while it is growing its stack.
            if is_self || sp >= stack_end || sp.add(self.platform.page_size()) < stack_min {
                warn!("Thread stack pointer {sp} out of range, pushing everything");
            }
            self.engine.push_root_range(stack_min, stack_end);
        }
        stack_end.distance_from(sp)
    }

    /// Lowest address of `descriptor`'s stack, updating its cache.
    fn stack_min_for(&self, descriptor: &ThreadDescriptor, sp: Address, is_self: bool) -> Address {
        let platform = &*self.platform;
        let stack_end = descriptor.stack_end();
        let section = descriptor.innermost_section();
        let mut last = descriptor.last_stack_min();

        if last.is_limit() {
            let from = section.map_or(stack_end, |s| s.boundary);
            let min = self.regions.stack_min(platform, from);
            self.store.note_mutation(descriptor);
            descriptor.set_last_stack_min(min);
            return min;
        }

        if let Some(section) = section {
            if last > section.boundary {
                self.store.note_mutation(descriptor);
                descriptor.set_last_stack_min(section.boundary);
                last = section.boundary;
            }
        }

        let min = if sp < stack_end && sp >= last {
            sp
        } else {
            // The stack may have grown below the cached minimum.
            let start = if is_self && sp < last { sp } else { last };
            match self.regions.stack_region(platform, start) {
                Some(region) if sp >= region.base && sp < stack_end => region.base,
                Some(_) => self.regions.stack_min(platform, last),
                None => self.regions.stack_min(platform, stack_end),
            }
        };
        self.store.note_mutation(descriptor);
        descriptor.set_last_stack_min(min);
        min
    }

    /// Returns true if `addr` lies in a readable, writable, non-guard
    /// mapping.
    pub fn may_be_in_stack(&self, addr: Address) -> bool {
        self.regions.stack_region(&*self.platform, addr).is_some()
    }

    /// Returns the next stack above `start`: the stack (thread or marker)
    /// whose cold end is the smallest one greater than `start`, as
    /// `(lo, hi)`.
    ///
    /// Returns `(LIMIT, LIMIT)` when there is none, and `(LIMIT, hi)` when
    /// that stack starts above `limit` and `limit` is not itself in a stack.
    pub fn get_next_stack(&self, start: Address, limit: Address, _guard: &AllocationGuard<'_>) -> (Address, Address) {
        let platform = &*self.platform;
        let mut current_min = Address::LIMIT;
        let mut owner = None;

        for descriptor in self.store.snapshot() {
            let end = descriptor.stack_end();
            if end > start && end < current_min {
                current_min = end;
                owner = Some(StackOwner::Thread(descriptor));
            }
        }
        if self.mode() == RegistryMode::Explicit {
            for marker in self.markers.marker_stacks() {
                let end = marker.stack_end();
                if end > start && end < current_min {
                    current_min = end;
                    owner = Some(StackOwner::Marker(marker));
                }
            }
        }

        let Some(owner) = owner else {
            return (Address::LIMIT, Address::LIMIT);
        };
        let hi = current_min;
        if current_min > limit && !self.may_be_in_stack(limit) {
            return (Address::LIMIT, hi);
        }

        let last = owner.last_stack_min();
        let lo = if last.is_limit() || !self.may_be_in_stack(last) {
            self.regions.stack_min(platform, current_min)
        } else {
            self.regions.stack_min(platform, last)
        };
        if let StackOwner::Thread(descriptor) = &owner {
            self.store.note_mutation(descriptor);
        }
        owner.set_last_stack_min(lo);
        (lo, hi)
    }
}
