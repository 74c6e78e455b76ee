//! Machine addresses.
//!
//! Stacks grow down, so the "cold" end of a stack is its highest address and
//! `Address::LIMIT` is used as the "unknown" marker for cached minimums.

use std::fmt;

/// A raw machine address.
///
/// Addresses are never dereferenced by this crate; they only delimit memory
/// ranges handed to the marker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// The highest representable address; means "not yet known".
    pub const LIMIT: Address = Address(usize::MAX);

    /// Creates an address from a raw word.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Address(raw)
    }

    /// Returns the raw word.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns true for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns true for [`Address::LIMIT`].
    #[inline]
    pub const fn is_limit(self) -> bool {
        self.0 == usize::MAX
    }

    /// Address `bytes` above this one, saturating at [`Address::LIMIT`].
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Address(self.0.saturating_add(bytes))
    }

    /// Address `bytes` below this one, saturating at null.
    #[inline]
    pub const fn sub(self, bytes: usize) -> Self {
        Address(self.0.saturating_sub(bytes))
    }

    /// Number of bytes from `lower` up to this address (zero if `lower` is higher).
    #[inline]
    pub const fn distance_from(self, lower: Address) -> usize {
        self.0.saturating_sub(lower.0)
    }

    /// Rounds down to a multiple of `align`, which must be a power of two.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Address(self.0 & !(align - 1))
    }
}

impl From<usize> for Address {
    fn from(raw: usize) -> Self {
        Address(raw)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
