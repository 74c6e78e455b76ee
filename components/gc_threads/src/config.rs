//! Registry configuration.
//!
//! All knobs are fixed before [`ThreadRegistry::init`](crate::ThreadRegistry::init)
//! and never change afterwards. The marker count environment override is
//! consulted exactly once, while the registry is being built.

use log::warn;

/// Default capacity of the lock-free descriptor array.
pub const MAX_THREADS: usize = 512;

/// Default number of hash buckets in the locked store.
pub const THREAD_TABLE_SIZE: usize = 256;

/// Hard cap on the number of markers (primary collector included).
pub const MAX_MARKERS: usize = 16;

/// Default bound on suspend / context-query attempts per thread.
pub const MAX_SUSPEND_RETRIES: u32 = 1_000_000;

/// Environment variable overriding the marker count.
pub const MARKERS_ENV: &str = "GC_MARKERS";

/// How threads become known to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    /// Threads register explicitly (or through the spawn wrapper).
    /// Backed by the locked hash table.
    Explicit,
    /// Threads are discovered through OS attach/detach notifications, where
    /// taking a blocking lock is forbidden. Backed by the lock-free array.
    Discovery,
}

/// Configuration for the thread registry.
#[derive(Debug, Clone)]
pub struct ThreadsConfig {
    /// Registration mode; selects the store backend.
    pub mode: RegistryMode,
    /// Capacity of the lock-free array (discovery mode)
    pub max_threads: usize,
    /// Number of buckets in the hash table (explicit mode)
    pub table_size: usize,
    /// Explicit marker count, including the primary collector thread
    pub markers: Option<usize>,
    /// Upper bound applied to every marker count source
    pub max_markers: usize,
    /// Attempts before a thread that refuses to stop aborts the process
    pub suspend_retry_limit: u32,
    /// Environment variable consulted for the marker count; `None` disables it
    pub markers_env: Option<String>,
    /// Whether fork hooks do any work
    pub handle_fork: bool,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        ThreadsConfig {
            mode: RegistryMode::Explicit,
            max_threads: MAX_THREADS,
            table_size: THREAD_TABLE_SIZE,
            markers: None,
            max_markers: MAX_MARKERS,
            suspend_retry_limit: MAX_SUSPEND_RETRIES,
            markers_env: Some(MARKERS_ENV.to_string()),
            handle_fork: true,
        }
    }
}

impl ThreadsConfig {
    /// Configuration for discovery mode with default limits.
    pub fn discovery() -> Self {
        ThreadsConfig {
            mode: RegistryMode::Discovery,
            ..Self::default()
        }
    }

    /// Sets the explicit marker count (clamped to `max_markers`).
    pub fn with_markers(mut self, markers: usize) -> Self {
        self.markers = Some(markers.min(self.max_markers));
        self
    }

    /// Resolves the total marker count from the environment, the explicit
    /// setting and the CPU count, in that order of precedence.
    pub fn resolve_marker_count(&self, cpus: usize) -> usize {
        let env_value = self
            .markers_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        self.resolve_marker_count_from(env_value.as_deref(), cpus)
    }

    /// Same as [`resolve_marker_count`](Self::resolve_marker_count) with an
    /// explicit environment value.
    pub fn resolve_marker_count_from(&self, env_value: Option<&str>, cpus: usize) -> usize {
        if let Some(raw) = env_value {
            return match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 && n <= self.max_markers => n,
                _ => {
                    warn!(
                        "Too big or invalid number of mark threads: {raw:?}; using maximum threads"
                    );
                    self.max_markers
                }
            };
        }
        match self.markers {
            Some(n) if n > 0 => n.min(self.max_markers),
            _ => cpus.max(1).min(self.max_markers),
        }
    }

    /// Number of helper threads for `markers` total markers (the primary
    /// included), or zero when parallel marking is off.
    pub fn helpers_for(&self, markers: usize) -> usize {
        if self.mode == RegistryMode::Discovery || markers <= 1 {
            return 0;
        }
        markers.min(self.max_markers) - 1
    }
}
