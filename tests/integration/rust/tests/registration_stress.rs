//! Registration under load
//!
//! Many threads register while marker helpers run and the collector keeps
//! stopping the world.

use core_types::{Address, ThreadKey};
use gc_threads::{RegistryMode, ThreadFlags};
use integration_tests::{config, World, PRIMARY};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const MUTATORS: u64 = 64;
const HELPERS: usize = 4;

fn count_stacks(world: &World) -> usize {
    let registry = &world.registry;
    let guard = registry.lock();
    let mut start = Address::NULL;
    let mut stacks = 0;
    loop {
        let (_, hi) = registry.get_next_stack(start, Address::LIMIT, &guard);
        if hi.is_limit() {
            return stacks;
        }
        stacks += 1;
        start = hi;
    }
}

#[test]
fn concurrent_registration_with_running_markers() {
    let world = World::new(config(RegistryMode::Explicit, HELPERS + 1));
    assert_eq!(world.registry.markers().helpers(), HELPERS);

    let mutators: Vec<_> = (0..MUTATORS)
        .map(|i| world.park_later(ThreadKey(100 + i)))
        .collect();
    let engine = Arc::clone(world.registry.engine());
    for _ in 0..10 {
        {
            let stopped = world.registry.stop_the_world();
            stopped.push_all_stacks();
        }
        world.registry.markers().do_parallel_mark(&*engine);
    }
    for mutator in &mutators {
        mutator.wait_ready();
    }

    assert_eq!(world.registry.live_threads(), MUTATORS as usize + 1);
    let ids: HashSet<_> = world.registry.descriptors().iter().map(|d| d.id()).collect();
    assert_eq!(ids.len(), MUTATORS as usize + 1);
    assert!(ids.contains(&PRIMARY));
    assert_eq!(world.registry.markers().marker_stacks().count(), HELPERS);
    assert_eq!(count_stacks(&world), MUTATORS as usize + 1 + HELPERS);

    {
        let stopped = world.registry.stop_the_world();
        let suspended = world
            .registry
            .descriptors()
            .iter()
            .filter(|d| d.has(ThreadFlags::SUSPENDED))
            .count();
        assert_eq!(suspended, MUTATORS as usize);
        stopped.push_all_stacks();
    }

    for mutator in mutators {
        mutator.release();
    }
    assert_eq!(world.registry.live_threads(), 1);
}

#[test]
fn churn_never_yields_two_live_descriptors_for_one_id() {
    let world = World::new(config(RegistryMode::Explicit, 1));
    let done = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..8u64)
        .map(|i| {
            let key = ThreadKey(200 + i);
            let registry = Arc::clone(&world.registry);
            let sim = Arc::clone(&world.sim);
            sim.map_stack(integration_tests::stack_end(key), integration_tests::STACK_SIZE);
            thread::spawn(move || {
                sim.bind_current(
                    key,
                    integration_tests::stack_end(key),
                    integration_tests::start_sp(key),
                );
                for _ in 0..50 {
                    integration_tests::attach(&registry, key);
                    thread::yield_now();
                    registry
                        .unregister_current_thread()
                        .expect("unregister");
                }
            })
        })
        .collect();

    let watcher = {
        let registry = Arc::clone(&world.registry);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let mut seen = HashSet::new();
                for descriptor in registry.descriptors() {
                    if !descriptor.has(ThreadFlags::FINISHED) {
                        assert!(seen.insert(descriptor.id()), "duplicate live id");
                    }
                }
                thread::yield_now();
            }
        })
    };

    for worker in workers {
        worker.join().expect("worker panicked");
    }
    done.store(true, Ordering::Release);
    watcher.join().expect("watcher found a duplicate");

    assert_eq!(world.registry.live_threads(), 1);
    // Each worker reused one descriptor for all of its registrations.
    assert_eq!(world.registry.descriptors().len(), 1 + 8);
}
