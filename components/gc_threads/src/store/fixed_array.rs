//! Lock-free descriptor array.

use super::ThreadStore;
use crate::descriptor::ThreadDescriptor;
use crate::error::{ThreadError, ThreadResult};
use core_types::{Address, OsHandle, ThreadKey};
use crossbeam::utils::CachePadded;
use log::trace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed-capacity store that never takes a lock.
///
/// Registration scans slots from the start and claims the first free one
/// with an atomic swap on its `in_use` flag. A high-water mark bounds reader
/// scans; concurrent claimers may push it past the capacity, so readers
/// clamp it.
pub struct FixedArrayStore {
    slots: Box<[Arc<ThreadDescriptor>]>,
    high_water: CachePadded<AtomicUsize>,
}

impl FixedArrayStore {
    /// Creates a store with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        FixedArrayStore {
            slots: (0..capacity)
                .map(|i| Arc::new(ThreadDescriptor::new(i)))
                .collect(),
            high_water: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots worth scanning: one past the highest slot ever claimed.
    pub fn scan_limit(&self) -> usize {
        self.high_water
            .load(Ordering::Acquire)
            .min(self.slots.len())
    }

    fn claim(&self) -> ThreadResult<usize> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.try_claim() {
                // Readers only need the mark to be at least this high.
                while self.high_water.load(Ordering::Acquire) <= index {
                    self.high_water.fetch_add(1, Ordering::AcqRel);
                }
                return Ok(index);
            }
        }
        Err(ThreadError::CapacityExceeded {
            capacity: self.slots.len(),
        })
    }

    fn in_use(&self) -> impl Iterator<Item = &Arc<ThreadDescriptor>> {
        self.slots[..self.scan_limit()]
            .iter()
            .filter(|d| d.is_in_use())
    }
}

impl ThreadStore for FixedArrayStore {
    fn name(&self) -> &'static str {
        "fixed-array"
    }

    fn register(
        &self,
        id: ThreadKey,
        handle: OsHandle,
        stack_end: Address,
    ) -> ThreadResult<Arc<ThreadDescriptor>> {
        let index = self.claim()?;
        let descriptor = &self.slots[index];
        descriptor.reinitialize(id, handle, stack_end);
        trace!("thread {id} claimed slot {index}");
        Ok(Arc::clone(descriptor))
    }

    fn lookup(&self, id: ThreadKey) -> Option<Arc<ThreadDescriptor>> {
        self.in_use().find(|d| d.id() == id).cloned()
    }

    fn unlink(&self, descriptor: &Arc<ThreadDescriptor>) {
        descriptor.clear();
        descriptor.release_slot();
    }

    fn snapshot(&self) -> Vec<Arc<ThreadDescriptor>> {
        self.in_use().cloned().collect()
    }

    fn retain_only(&self, keep: &Arc<ThreadDescriptor>, new_id: ThreadKey) {
        for descriptor in self.in_use() {
            if !Arc::ptr_eq(descriptor, keep) {
                self.unlink(descriptor);
            }
        }
        keep.set_id(new_id);
    }
}
