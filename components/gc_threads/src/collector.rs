//! Interfaces to the rest of the collector.
//!
//! The mark/sweep engine and the internal allocator are external
//! collaborators. The registry only pushes root ranges into the engine, asks
//! it about collection progress, and reserves descriptor storage from the
//! allocator.

use core_types::Address;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// The tracing side of the collector.
pub trait MarkEngine: Send + Sync {
    /// Treats every word in `[low, high)` as a potential pointer.
    fn push_root_range(&self, low: Address, high: Address);

    /// Treats each value as a potential pointer (saved registers).
    fn push_root_words(&self, words: &[usize]);

    /// Returns true while an incremental collection is running.
    fn is_collection_in_progress(&self) -> bool {
        false
    }

    /// Performs a small amount of pending collection work.
    fn collect_a_little(&self) {}

    /// Number of completed collections.
    fn gc_number(&self) -> u64 {
        0
    }

    /// Runs one bounded unit of marking work on behalf of helper `helper`
    /// for mark generation `generation`.
    fn perform_bounded_mark_work(&self, helper: usize, generation: u64) {
        let _ = (helper, generation);
    }
}

/// Opaque token for storage obtained from the internal allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalBlock(pub usize);

/// Storage source for thread descriptors.
pub trait InternalAllocator: Send + Sync {
    /// Reserves `size` bytes. `None` means out of memory.
    fn allocate_internal(&self, size: usize) -> Option<InternalBlock>;

    /// Returns storage obtained from [`allocate_internal`](Self::allocate_internal).
    fn free_internal(&self, block: InternalBlock);

    /// Write-barrier hook for a descriptor about to be mutated.
    fn mark_object_dirty(&self, block: InternalBlock) {
        let _ = block;
    }
}

/// Allocator that always succeeds and counts what is outstanding.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    next: AtomicUsize,
    outstanding: AtomicUsize,
    dirtied: AtomicUsize,
    fail: AtomicBool,
}

impl CountingAllocator {
    /// Creates the allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following allocation fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Blocks allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Number of write-barrier notifications received.
    pub fn dirtied(&self) -> usize {
        self.dirtied.load(Ordering::Relaxed)
    }
}

impl InternalAllocator for CountingAllocator {
    fn allocate_internal(&self, _size: usize) -> Option<InternalBlock> {
        if self.fail.load(Ordering::Relaxed) {
            return None;
        }
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Some(InternalBlock(self.next.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn free_internal(&self, _block: InternalBlock) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    fn mark_object_dirty(&self, _block: InternalBlock) {
        self.dirtied.fetch_add(1, Ordering::Relaxed);
    }
}

/// A [`MarkEngine`] that records the roots it is given.
///
/// Useful for embedders that want to inspect root discovery, and for tests.
#[derive(Debug, Default)]
pub struct RootRecorder {
    ranges: Mutex<Vec<(Address, Address)>>,
    words: Mutex<Vec<usize>>,
    in_progress: AtomicBool,
    gc_no: AtomicU64,
    steps: AtomicU64,
    steps_per_cycle: AtomicU64,
    mark_work: AtomicU64,
}

impl RootRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an incremental collection that finishes after `steps`
    /// calls to [`collect_a_little`](MarkEngine::collect_a_little).
    pub fn start_incremental(&self, steps: u64) {
        self.steps.store(0, Ordering::SeqCst);
        self.steps_per_cycle.store(steps, Ordering::SeqCst);
        self.in_progress.store(true, Ordering::SeqCst);
    }

    /// Recorded root ranges.
    pub fn ranges(&self) -> Vec<(Address, Address)> {
        self.ranges.lock().clone()
    }

    /// Recorded register words.
    pub fn words(&self) -> Vec<usize> {
        self.words.lock().clone()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.ranges.lock().clear();
        self.words.lock().clear();
    }

    /// Units of mark work performed by helpers.
    pub fn mark_work(&self) -> u64 {
        self.mark_work.load(Ordering::SeqCst)
    }
}

impl MarkEngine for RootRecorder {
    fn push_root_range(&self, low: Address, high: Address) {
        if low < high {
            self.ranges.lock().push((low, high));
        }
    }

    fn push_root_words(&self, words: &[usize]) {
        self.words.lock().extend_from_slice(words);
    }

    fn is_collection_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    fn collect_a_little(&self) {
        if !self.in_progress.load(Ordering::SeqCst) {
            return;
        }
        let done = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if done >= self.steps_per_cycle.load(Ordering::SeqCst) {
            self.in_progress.store(false, Ordering::SeqCst);
            self.gc_no.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gc_number(&self) -> u64 {
        self.gc_no.load(Ordering::SeqCst)
    }

    fn perform_bounded_mark_work(&self, _helper: usize, _generation: u64) {
        self.mark_work.fetch_add(1, Ordering::SeqCst);
    }
}
