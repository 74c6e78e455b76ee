//! Collection cycles on real OS threads
//!
//! Mutators spawned through the registry allocate (take the allocation
//! lock) in a loop, some of them spending time in blocking calls, while the
//! primary thread runs several collections with parallel marking on.

#![cfg(target_os = "linux")]

use gc_threads::{NativePlatform, Platform, RegistryMode, RootRecorder, ThreadFlags, ThreadRegistry};
use integration_tests::config;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MUTATORS: usize = 6;

#[test]
fn collections_interleave_with_allocating_and_blocking_mutators() {
    let _ = env_logger::builder().is_test(true).try_init();
    let platform: Arc<dyn Platform> = Arc::new(NativePlatform::new());
    let engine = Arc::new(RootRecorder::new());
    let registry = ThreadRegistry::init(
        config(RegistryMode::Explicit, 3),
        platform,
        engine.clone(),
    )
    .unwrap();
    registry.allow_register_threads();

    let stop = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicUsize::new(0));
    let mutators: Vec<_> = (0..MUTATORS)
        .map(|i| {
            let (r, stop, running) = (Arc::clone(&registry), Arc::clone(&stop), Arc::clone(&running));
            registry
                .spawn(move || {
                    running.fetch_add(1, Ordering::AcqRel);
                    while !stop.load(Ordering::Acquire) {
                        if i % 2 == 1 {
                            r.enter_blocking_call(|| thread::sleep(Duration::from_micros(200)))
                                .expect("blocking call");
                        }
                        drop(r.lock());
                        thread::yield_now();
                    }
                })
                .unwrap()
        })
        .collect();
    while running.load(Ordering::Acquire) < MUTATORS {
        thread::yield_now();
    }

    let markers_engine = Arc::clone(registry.engine());
    let me = registry.platform().current_thread_id();
    for _ in 0..5 {
        {
            let stopped = registry.stop_the_world();
            for descriptor in registry.descriptors() {
                if descriptor.has(ThreadFlags::FINISHED) {
                    continue;
                }
                let flags = descriptor.flags();
                let is_self = descriptor.id() == me;
                assert!(
                    is_self
                        || flags.contains(ThreadFlags::SUSPENDED)
                        || flags.contains(ThreadFlags::BLOCKING),
                    "thread {} kept running during a stop",
                    descriptor.id()
                );
            }
            assert!(stopped.push_all_stacks() > 0);
        }
        registry.markers().do_parallel_mark(&*markers_engine);
    }
    assert!(engine.ranges().len() >= MUTATORS + 1);

    stop.store(true, Ordering::Release);
    for mutator in mutators {
        mutator.join().unwrap();
    }
    assert_eq!(registry.live_threads(), 1);
    assert_eq!(registry.descriptors().len(), 1);
}
