//! Thread coordination and root discovery for a conservative collector.
//!
//! This crate tracks every mutator thread, stops and restarts them around a
//! collection, and reports their stacks and saved registers as roots.
//!
//! # Overview
//!
//! - [`ThreadRegistry`] - Registration, blocking calls, spawning and fork hooks
//! - [`WorldStopped`] - RAII stop-the-world guard
//! - [`ThreadStore`] - Descriptor storage ([`HashTableStore`] or [`FixedArrayStore`])
//! - [`MarkCoordinator`] - Parallel mark helper pool
//! - [`Platform`] - OS thread and memory services ([`NativePlatform`], [`SimulatedPlatform`])
//! - [`MarkEngine`] - Where discovered roots go
//!
//! # Examples
//!
//! ```
//! use core_types::{Address, ThreadKey};
//! use gc_threads::{RootRecorder, SimulatedPlatform, ThreadRegistry, ThreadsConfig};
//! use std::sync::Arc;
//!
//! let sim = Arc::new(SimulatedPlatform::new(1));
//! sim.map_stack(Address::new(0x10_0000), 0x4000);
//! sim.bind_current(ThreadKey(1), Address::new(0x10_0000), Address::new(0xf_f800));
//! let engine = Arc::new(RootRecorder::new());
//!
//! let registry = ThreadRegistry::init(ThreadsConfig::default(), sim.clone(), engine.clone()).unwrap();
//! let world = registry.stop_the_world();
//! assert_eq!(world.push_all_stacks(), 0x800);
//! drop(world);
//! assert_eq!(engine.ranges(), vec![(Address::new(0xf_f800), Address::new(0x10_0000))]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arch;
pub mod collector;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod fork;
pub mod lock;
pub mod parallel_mark;
pub mod platform;
pub mod registry;
pub mod stack_scan;
pub mod stop_world;
pub mod store;

// Re-export main types at crate root
pub use arch::{capture_register_roots, ArchTable, RegisterContext};
pub use collector::{CountingAllocator, InternalAllocator, InternalBlock, MarkEngine, RootRecorder};
pub use config::{RegistryMode, ThreadsConfig};
pub use descriptor::{ThreadDescriptor, ThreadFlags, TracedSection};
pub use error::{fatal, RegisterStatus, ThreadError, ThreadResult};
pub use fork::ForkGuard;
pub use lock::{AllocationGuard, AllocationLock};
pub use parallel_mark::{MarkCoordinator, MarkerStack};
#[cfg(target_os = "linux")]
pub use platform::NativePlatform;
pub use platform::{MemoryRegion, Platform, Protection, SimulatedPlatform};
pub use registry::{RegisteredJoinHandle, ThreadRegistry};
pub use stop_world::{ThreadEvent, ThreadEventCallback, WorldPhase, WorldStopped};
pub use store::{FixedArrayStore, HashTableStore, ThreadStore};
