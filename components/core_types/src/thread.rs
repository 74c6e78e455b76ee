//! Thread identity types.

use std::fmt;

/// Platform thread identifier.
///
/// Unique among live threads; a platform may recycle it once the thread has
/// been joined or retired.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadKey(pub u64);

impl ThreadKey {
    /// Identifier that never names a real thread.
    pub const NONE: ThreadKey = ThreadKey(0);

    /// Returns true unless this is [`ThreadKey::NONE`].
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadKey({:#x})", self.0)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An OS handle that can be used to suspend, resume or query a thread.
///
/// Whoever duplicated the handle owns it and must close it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OsHandle(pub u64);

impl OsHandle {
    /// The invalid handle.
    pub const INVALID: OsHandle = OsHandle(0);

    /// Returns true unless this is [`OsHandle::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}
