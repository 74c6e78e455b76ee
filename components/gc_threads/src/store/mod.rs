//! Thread record store.
//!
//! Two interchangeable backends implement [`ThreadStore`]:
//!
//! - [`HashTableStore`]: buckets keyed by thread id. Mutation requires the
//!   allocation lock; descriptor storage comes from the internal allocator.
//! - [`FixedArrayStore`]: a preallocated array claimed slot by slot with an
//!   atomic swap. Never blocks, so it can be used from OS attach hooks.
//!
//! The registry picks one at construction time from the configured
//! [`RegistryMode`](crate::RegistryMode) and never switches.

mod fixed_array;
mod hash_table;

pub use fixed_array::FixedArrayStore;
pub use hash_table::HashTableStore;

use crate::descriptor::{ThreadDescriptor, ThreadFlags};
use crate::error::ThreadResult;
use core_types::{Address, OsHandle, ThreadKey};
use std::sync::Arc;

/// Storage for thread descriptors.
pub trait ThreadStore: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Installs a fresh descriptor for `id`.
    fn register(
        &self,
        id: ThreadKey,
        handle: OsHandle,
        stack_end: Address,
    ) -> ThreadResult<Arc<ThreadDescriptor>>;

    /// Finds the newest descriptor for `id`, finished or not.
    fn lookup(&self, id: ThreadKey) -> Option<Arc<ThreadDescriptor>>;

    /// Removes `descriptor` from the store.
    ///
    /// The array backend clears the record and frees the slot for reuse; the
    /// hash backend unlinks it and returns its storage to the allocator.
    fn unlink(&self, descriptor: &Arc<ThreadDescriptor>);

    /// Every linked descriptor, in iteration order.
    fn snapshot(&self) -> Vec<Arc<ThreadDescriptor>>;

    /// Drops every descriptor except `keep`, which is re-keyed to `new_id`.
    fn retain_only(&self, keep: &Arc<ThreadDescriptor>, new_id: ThreadKey);

    /// Write-barrier notification before a descriptor is mutated.
    fn note_mutation(&self, descriptor: &ThreadDescriptor) {
        let _ = descriptor;
    }

    /// Number of descriptors that are not finished.
    fn live_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|d| !d.has(ThreadFlags::FINISHED))
            .count()
    }
}
