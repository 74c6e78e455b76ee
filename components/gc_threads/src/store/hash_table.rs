//! Locked hash table of descriptors.

use super::ThreadStore;
use crate::collector::InternalAllocator;
use crate::descriptor::ThreadDescriptor;
use crate::error::{ThreadError, ThreadResult};
use core_types::{Address, OsHandle, ThreadKey};
use log::trace;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hash table keyed by `(id >> 2) % table_size`, newest entry first in each
/// bucket.
///
/// Writers hold the registry's allocation lock; the inner `RwLock` only makes
/// the unlocked self-lookup of a running thread sound. The first registered
/// thread uses a statically reserved descriptor because it registers before
/// the allocator may be used; that descriptor is never returned to the
/// allocator.
pub struct HashTableStore {
    buckets: RwLock<Vec<Vec<Arc<ThreadDescriptor>>>>,
    first: Arc<ThreadDescriptor>,
    first_used: AtomicBool,
    allocator: Arc<dyn InternalAllocator>,
}

impl HashTableStore {
    /// Creates a table with `table_size` buckets.
    pub fn new(table_size: usize, allocator: Arc<dyn InternalAllocator>) -> Self {
        HashTableStore {
            buckets: RwLock::new(vec![Vec::new(); table_size.max(1)]),
            first: Arc::new(ThreadDescriptor::new(0)),
            first_used: AtomicBool::new(false),
            allocator,
        }
    }

    fn bucket_of(&self, id: ThreadKey, len: usize) -> usize {
        ((id.0 >> 2) % len as u64) as usize
    }

    fn new_descriptor(&self) -> ThreadResult<Arc<ThreadDescriptor>> {
        if !self.first_used.swap(true, Ordering::AcqRel) {
            return Ok(Arc::clone(&self.first));
        }
        let block = self
            .allocator
            .allocate_internal(std::mem::size_of::<ThreadDescriptor>())
            .ok_or(ThreadError::AllocationFailed)?;
        let descriptor = Arc::new(ThreadDescriptor::new(0));
        descriptor.set_block(Some(block));
        Ok(descriptor)
    }

    fn release_storage(&self, descriptor: &ThreadDescriptor) {
        descriptor.release_slot();
        if let Some(block) = descriptor.block() {
            descriptor.set_block(None);
            self.allocator.free_internal(block);
        }
    }

    /// Returns true if `descriptor` is the statically reserved one.
    pub fn is_first(&self, descriptor: &Arc<ThreadDescriptor>) -> bool {
        Arc::ptr_eq(descriptor, &self.first)
    }
}

impl ThreadStore for HashTableStore {
    fn name(&self) -> &'static str {
        "hash-table"
    }

    fn register(
        &self,
        id: ThreadKey,
        handle: OsHandle,
        stack_end: Address,
    ) -> ThreadResult<Arc<ThreadDescriptor>> {
        let descriptor = self.new_descriptor()?;
        descriptor.try_claim();
        descriptor.reinitialize(id, handle, stack_end);

        let mut buckets = self.buckets.write();
        let index = self.bucket_of(id, buckets.len());
        buckets[index].insert(0, Arc::clone(&descriptor));
        trace!("thread {id} linked into bucket {index}");
        Ok(descriptor)
    }

    fn lookup(&self, id: ThreadKey) -> Option<Arc<ThreadDescriptor>> {
        let buckets = self.buckets.read();
        let index = self.bucket_of(id, buckets.len());
        buckets[index].iter().find(|d| d.id() == id).cloned()
    }

    fn unlink(&self, descriptor: &Arc<ThreadDescriptor>) {
        let mut buckets = self.buckets.write();
        let index = self.bucket_of(descriptor.id(), buckets.len());
        let before = buckets[index].len();
        buckets[index].retain(|d| !Arc::ptr_eq(d, descriptor));
        if buckets[index].len() == before {
            for bucket in buckets.iter_mut() {
                bucket.retain(|d| !Arc::ptr_eq(d, descriptor));
            }
        }
        drop(buckets);
        self.release_storage(descriptor);
    }

    fn snapshot(&self) -> Vec<Arc<ThreadDescriptor>> {
        self.buckets.read().iter().flatten().cloned().collect()
    }

    fn retain_only(&self, keep: &Arc<ThreadDescriptor>, new_id: ThreadKey) {
        let mut buckets = self.buckets.write();
        for bucket in buckets.iter_mut() {
            for descriptor in bucket.drain(..) {
                if !Arc::ptr_eq(&descriptor, keep) {
                    self.release_storage(&descriptor);
                }
            }
        }
        keep.set_id(new_id);
        let index = self.bucket_of(new_id, buckets.len());
        buckets[index].push(Arc::clone(keep));
    }

    fn note_mutation(&self, descriptor: &ThreadDescriptor) {
        if let Some(block) = descriptor.block() {
            self.allocator.mark_object_dirty(block);
        }
    }
}
