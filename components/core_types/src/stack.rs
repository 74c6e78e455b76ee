//! Stack base descriptions and stack pointer approximation.

use crate::Address;

/// The cold end of a thread stack.
///
/// Stacks grow towards lower addresses, so `mem_base` is the highest
/// address that belongs to the stack (exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBase {
    /// Exclusive upper bound of the stack.
    pub mem_base: Address,
}

impl StackBase {
    /// Creates a stack base from its upper bound.
    pub const fn new(mem_base: Address) -> Self {
        StackBase { mem_base }
    }

    /// Returns true if no base was recorded.
    pub const fn is_null(&self) -> bool {
        self.mem_base.is_null()
    }
}

/// Returns an address inside the caller's current stack frame.
///
/// The value is only an approximation of the hardware stack pointer; it is
/// always inside the live part of the stack, which is all a conservative
/// scanner needs.
#[inline(never)]
pub fn approximate_sp() -> Address {
    let marker = 0u8;
    let addr = std::hint::black_box(&marker) as *const u8 as usize;
    Address::new(addr)
}

/// Calls `f` with a stack base taken from a frame that outlives the call.
///
/// Everything `f` and its callees place on the stack is below the reported
/// base. Used when the platform cannot report the real stack mapping.
#[inline(never)]
pub fn with_stack_base<R>(f: impl FnOnce(StackBase) -> R) -> R {
    let anchor = [0usize; 4];
    let top = std::hint::black_box(&anchor) as *const [usize; 4] as usize;
    let base = StackBase::new(Address::new(top + std::mem::size_of_val(&anchor)));
    let result = f(base);
    std::hint::black_box(&anchor);
    result
}
