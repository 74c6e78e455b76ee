//! OS services the registry depends on.
//!
//! Everything the collector asks of the operating system goes through the
//! [`Platform`] trait: thread identity and handles, suspension, register
//! contexts and memory-protection queries. Two implementations exist:
//!
//! - [`NativePlatform`]: real threads on Linux, stopped with signals, with
//!   stack bounds taken from the thread attributes.
//! - [`SimulatedPlatform`]: a deterministic model used by tests and by
//!   embedders that manage their own notion of threads.

#[cfg(target_os = "linux")]
mod native;
mod simulated;

#[cfg(target_os = "linux")]
pub use native::NativePlatform;
pub use simulated::SimulatedPlatform;

use crate::arch::RegisterContext;
use bitflags::bitflags;
use core_types::{Address, OsHandle, StackBase, ThreadKey};

bitflags! {
    /// Access rights of a memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXEC = 1 << 2;
        /// Guard page: touching it faults (or grows the stack)
        const GUARD = 1 << 3;
    }
}

/// A contiguous mapping with uniform protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Lowest address of the region
    pub base: Address,
    /// Size in bytes
    pub size: usize,
    /// Access rights
    pub protection: Protection,
}

impl MemoryRegion {
    /// Exclusive upper bound.
    pub fn end(&self) -> Address {
        self.base.add(self.size)
    }

    /// Returns true if `addr` lies inside the region.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Read-write and not a guard page: memory a stack can live in.
    pub fn is_stack_like(&self) -> bool {
        self.protection.contains(Protection::READ | Protection::WRITE)
            && !self.protection.contains(Protection::GUARD)
    }
}

/// The register context of a thread could not be read right now.
///
/// The thread may have been stopped inside OS-internal code; asking again
/// after letting it run a little usually succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextUnavailable;

/// Operating system services used by the registry.
///
/// Handles returned by [`duplicate_current_handle`](Platform::duplicate_current_handle)
/// belong to the caller and must be released with
/// [`close_handle`](Platform::close_handle).
pub trait Platform: Send + Sync {
    /// Identifier of the calling thread.
    fn current_thread_id(&self) -> ThreadKey;

    /// A new handle for the calling thread, or `None` on failure.
    fn duplicate_current_handle(&self) -> Option<OsHandle>;

    /// Releases a handle.
    fn close_handle(&self, handle: OsHandle);

    /// Returns true once the thread behind `handle` has terminated.
    fn has_exited(&self, handle: OsHandle) -> bool;

    /// Asks the OS to suspend the thread. Returns false on failure.
    fn suspend(&self, handle: OsHandle) -> bool;

    /// Undoes one [`suspend`](Platform::suspend). Returns false on failure.
    fn resume(&self, handle: OsHandle) -> bool;

    /// Reads the register context of a thread.
    fn get_context(&self, handle: OsHandle) -> Result<RegisterContext, ContextUnavailable>;

    /// Describes the region containing `addr`, or `None` if it is unmapped
    /// or the platform cannot tell.
    fn query_region(&self, addr: Address) -> Option<MemoryRegion>;

    /// An address in the calling thread's current frame.
    fn approximate_sp(&self) -> Address;

    /// The cold end of the calling thread's stack, if the platform knows it.
    fn current_stack_base(&self) -> Option<StackBase>;

    /// Page granularity used by the out-of-range stack pointer check.
    fn page_size(&self) -> usize {
        4096
    }

    /// Number of processors available for marking.
    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
