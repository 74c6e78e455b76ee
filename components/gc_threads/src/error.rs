//! Error types for thread registration and world control.
//!
//! Errors fall into two classes. Fatal errors mean the platform or the
//! registry is in a state where continuing could corrupt the heap; the public
//! entry points hand them to [`fatal`], which logs and aborts. Everything else
//! is returned to the caller.

use core_types::ThreadKey;
use log::error;
use thiserror::Error;

/// Errors raised by the thread registry.
#[derive(Debug, Error)]
pub enum ThreadError {
    /// The lock-free store has no free slot left.
    #[error("Too many threads (capacity {capacity})")]
    CapacityExceeded {
        /// Configured capacity
        capacity: usize,
    },

    /// The internal allocator refused to provide descriptor storage.
    #[error("Failed to allocate thread descriptor")]
    AllocationFailed,

    /// The OS handle of the current thread could not be duplicated.
    #[error("DuplicateHandle failed for thread {0}")]
    HandleDuplication(ThreadKey),

    /// Registration was attempted with a null stack base.
    #[error("Bad stack base for thread {0}")]
    BadStackBase(ThreadKey),

    /// Explicit registration before `allow_register_threads`.
    #[error("Threads explicit registering is not previously enabled")]
    RegistrationNotAllowed,

    /// The calling thread has no descriptor.
    #[error("Thread {0} is not registered")]
    NotRegistered(ThreadKey),

    /// A thread could not be resumed.
    #[error("ResumeThread failed for thread {0}")]
    ResumeFailed(ThreadKey),

    /// A thread never reached a state with a readable register context.
    #[error("SuspendThread loop failed for thread {thread} after {attempts} attempts")]
    SuspendRetriesExhausted {
        /// Thread that refused to stop
        thread: ThreadKey,
        /// Attempts made
        attempts: u32,
    },

    /// Roots were pushed from a thread the registry does not know about.
    #[error("Collecting from unknown thread")]
    UnknownCollector,

    /// Fork hooks were used where they cannot work.
    #[error("Fork handling is unavailable: {0}")]
    ForkUnsupported(&'static str),

    /// The OS refused to create a thread.
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ThreadError {
    /// Returns true for errors that must terminate the process when they
    /// reach a public entry point.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ThreadError::AllocationFailed
                | ThreadError::NotRegistered(_)
                | ThreadError::ForkUnsupported(_)
                | ThreadError::Spawn(_)
        )
    }
}

/// Result type for registry operations.
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Outcome of a successful registration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStatus {
    /// A descriptor was installed or revived.
    Success,
    /// The thread was already registered and live; nothing changed.
    Duplicate,
}

/// Logs `err` and aborts the process.
#[cold]
pub fn fatal(err: ThreadError) -> ! {
    error!("{err}");
    std::process::abort()
}

/// Aborts on fatal errors and passes the rest through.
pub(crate) fn escalate<T>(result: ThreadResult<T>) -> ThreadResult<T> {
    match result {
        Err(err) if err.is_fatal() => fatal(err),
        other => other,
    }
}

/// Aborts on any error.
pub(crate) fn or_abort<T>(result: ThreadResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(err),
    }
}
