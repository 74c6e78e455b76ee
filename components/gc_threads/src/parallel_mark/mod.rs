//! Parallel mark coordination.
//!
//! A fixed pool of helper threads assists the primary collector thread.
//! Work is handed out by comparing mark generation counters rather than
//! through a work-stealing queue; the queue of mark items belongs to the
//! [`MarkEngine`](crate::MarkEngine).

mod event;
mod mark_lock;
mod pool;

pub use event::Event;
pub use mark_lock::{MarkLock, MarkLockGuard};
pub use pool::{MarkCoordinator, MarkerStack};
