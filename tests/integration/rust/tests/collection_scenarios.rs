//! Collection cycles seen from mutator threads
//!
//! Each scenario runs stop-the-world and root scanning against threads that
//! register, block, or arrive while a collection is already running.

use core_types::ThreadKey;
use crossbeam::channel::bounded;
use gc_threads::{RegistryMode, ThreadFlags, WorldPhase};
use integration_tests::{config, stack_end, start_sp, World, PRIMARY, STACK_SIZE};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn stop_and_start_restore_every_flag() {
    let world = World::new(config(RegistryMode::Explicit, 1));
    let parked: Vec<_> = (2..6).map(|k| world.park(ThreadKey(k))).collect();
    let before: Vec<_> = world
        .registry
        .descriptors()
        .iter()
        .map(|d| (d.id(), d.flags()))
        .collect();

    drop(world.registry.stop_the_world());

    assert_eq!(world.registry.world_phase(), WorldPhase::Running);
    for (id, flags) in before {
        assert_eq!(world.registry.descriptor(id).unwrap().flags(), flags);
    }
    for p in parked {
        p.release();
    }
}

#[test]
fn blocking_call_spans_a_collection() {
    let world = World::new(config(RegistryMode::Explicit, 1));
    let key = ThreadKey(2);
    world.sim.map_stack(stack_end(key), STACK_SIZE);
    let (entered_tx, entered_rx) = bounded::<()>(1);
    let (resume_tx, resume_rx) = bounded::<()>(1);
    let (back_tx, back_rx) = bounded::<()>(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let registry = Arc::clone(&world.registry);
    let sim = Arc::clone(&world.sim);

    let mutator = thread::spawn(move || {
        sim.bind_current(key, stack_end(key), start_sp(key));
        integration_tests::attach(&registry, key);
        registry
            .enter_blocking_call(|| {
                let _ = entered_tx.send(());
                let _ = resume_rx.recv();
                thread::sleep(Duration::from_millis(5));
            })
            .expect("blocking call");
        // Allocation resumes right after the call returns.
        drop(registry.lock());
        let _ = back_tx.send(());
        let _ = release_rx.recv();
        integration_tests::detach(&registry);
    });

    entered_rx.recv().unwrap();
    {
        let stopped = world.registry.stop_the_world();
        assert_eq!(world.sim.suspend_calls(key), 0);
        let descriptor = world.registry.descriptor(key).unwrap();
        assert!(descriptor.has(ThreadFlags::BLOCKING));
        stopped.push_all_stacks();
    }
    assert!(world
        .engine
        .ranges()
        .contains(&(start_sp(key), stack_end(key))));

    let _ = resume_tx.send(());
    back_rx.recv().unwrap();
    {
        let _stopped = world.registry.stop_the_world();
        assert_eq!(world.sim.suspend_calls(key), 1);
        assert!(world.sim.is_suspended(key));
    }
    let _ = release_tx.send(());
    mutator.join().unwrap();
}

#[test]
fn scanned_span_lies_between_stack_min_and_end() {
    let world = World::new(config(RegistryMode::Explicit, 1));
    let parked: Vec<_> = (2..5).map(|k| world.park(ThreadKey(k))).collect();
    {
        let stopped = world.registry.stop_the_world();
        stopped.push_all_stacks();
        for descriptor in world.registry.descriptors() {
            if descriptor.id() == PRIMARY {
                continue;
            }
            let sp = descriptor.saved_context().unwrap().sp();
            assert!(descriptor.last_stack_min() <= sp);
            assert!(sp <= descriptor.stack_end());
        }
    }
    for p in parked {
        p.release();
    }
}

#[test]
fn explicit_registration_waits_for_running_collection() {
    let world = World::new(config(RegistryMode::Explicit, 1));
    let late_key = ThreadKey(2);
    let late;
    {
        let stopped = world.registry.stop_the_world();
        late = world.park_later(late_key);
        thread::sleep(Duration::from_millis(20));
        assert!(world.registry.descriptor(late_key).is_none());
        assert!(!world.registry.started_thread_while_stopped());
        stopped.push_all_stacks();
    }
    late.wait_ready();

    world.engine.clear();
    world.registry.stop_the_world().push_all_stacks();
    assert!(world
        .engine
        .ranges()
        .contains(&(start_sp(late_key), stack_end(late_key))));
    late.release();
}

#[test]
fn discovered_thread_during_collection_forces_restart() {
    let world = World::new(config(RegistryMode::Discovery, 1));
    let late_key = ThreadKey(2);
    let stopped = world.registry.stop_the_world();
    let late = world.park(late_key);

    // The collector notices the newcomer and runs the cycle again.
    assert!(world.registry.started_thread_while_stopped());
    drop(stopped);
    world.engine.clear();
    world.registry.stop_the_world().push_all_stacks();
    assert!(world
        .engine
        .ranges()
        .contains(&(start_sp(late_key), stack_end(late_key))));
    assert!(!world.registry.started_thread_while_stopped());
    late.release();
}

#[test]
fn panicking_mutator_leaves_no_live_descriptor() {
    let world = World::new(config(RegistryMode::Explicit, 1));
    let handle = world
        .registry
        .spawn(|| panic!("mutator failure"))
        .unwrap();
    assert!(handle.join().is_err());
    assert_eq!(world.registry.live_threads(), 1);
    drop(world.registry.stop_the_world());
    assert_eq!(world.registry.world_phase(), WorldPhase::Running);
}
