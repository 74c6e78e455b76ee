//! Unit tests for registration and lifecycle

use super::*;
use gc_threads::{MarkEngine, RegisterStatus, ThreadError, ThreadFlags};
use std::time::{Duration, Instant};

#[test]
fn primary_thread_is_registered_at_init() {
    let fx = explicit();
    assert!(fx.registry.is_current_thread_registered());
    assert_eq!(fx.registry.live_threads(), 1);
    let (base, descriptor) = fx.registry.get_my_stack_bottom().unwrap();
    assert_eq!(base.mem_base, stack_end_for(PRIMARY));
    assert_eq!(descriptor.id(), PRIMARY);
}

#[test]
fn registered_mutator_is_live_until_it_unregisters() {
    let fx = explicit();
    let mutator = parked(&fx, ThreadKey(2));
    assert_eq!(fx.registry.live_threads(), 2);
    let descriptor = fx.registry.descriptor(ThreadKey(2)).unwrap();
    assert_eq!(descriptor.stack_end(), stack_end_for(ThreadKey(2)));

    mutator.release();
    assert_eq!(fx.registry.live_threads(), 1);
    // Not joined through the registry, so the record stays until reclaimed.
    assert!(descriptor.has(ThreadFlags::FINISHED));
    assert_eq!(fx.registry.descriptors().len(), 2);
}

#[test]
fn registration_before_allow_is_rejected() {
    let fx = fixture_with(quiet_config(RegistryMode::Explicit));
    let registry = Arc::clone(&fx.registry);
    let result = thread::spawn(move || {
        registry.try_register_current_thread(StackBase::new(Address::new(0x4000_0000)))
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(ThreadError::RegistrationNotAllowed)));
    assert_eq!(fx.registry.live_threads(), 1);
}

#[test]
fn second_registration_is_a_duplicate() {
    let fx = explicit();
    let status = fx
        .registry
        .register_current_thread(StackBase::new(stack_end_for(PRIMARY)))
        .unwrap();
    assert_eq!(status, RegisterStatus::Duplicate);
    assert_eq!(fx.registry.live_threads(), 1);
}

#[test]
fn null_stack_base_is_rejected() {
    let fx = explicit();
    let registry = Arc::clone(&fx.registry);
    let result = thread::spawn(move || {
        registry.try_register_current_thread(StackBase::new(Address::NULL))
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(ThreadError::BadStackBase(_))));
}

#[test]
fn handle_duplication_failure_leaves_store_unchanged() {
    let fx = explicit();
    fx.sim.fail_handle_duplication(true);
    let registry = Arc::clone(&fx.registry);
    let result = thread::spawn(move || {
        registry.try_register_current_thread(StackBase::new(Address::new(0x4000_0000)))
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(ThreadError::HandleDuplication(_))));
    assert_eq!(fx.registry.descriptors().len(), 1);
}

#[test]
fn allocation_failure_is_recoverable() {
    let fx = explicit();
    fx.allocator.set_failing(true);
    let registry = Arc::clone(&fx.registry);
    let result = thread::spawn(move || {
        registry.register_current_thread(StackBase::new(Address::new(0x4000_0000)))
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(ThreadError::AllocationFailed)));
    assert_eq!(fx.registry.live_threads(), 1);
    // The handle duplicated for the failed attempt was closed again.
    assert_eq!(fx.sim.open_handles(), 1);
}

#[test]
fn discovery_capacity_is_enforced() {
    let config = ThreadsConfig {
        max_threads: 2,
        ..quiet_config(RegistryMode::Discovery)
    };
    let fx = fixture_with(config);
    let second = parked(&fx, ThreadKey(2));
    let registry = Arc::clone(&fx.registry);
    let result = thread::spawn(move || {
        registry.try_register_current_thread(StackBase::new(Address::new(0x4000_0000)))
    })
    .join()
    .unwrap();
    assert!(matches!(
        result,
        Err(ThreadError::CapacityExceeded { capacity: 2 })
    ));
    second.release();
    assert_eq!(fx.registry.live_threads(), 1);
}

#[test]
fn discovery_detach_frees_slot() {
    let fx = discovery();
    let mutator = parked(&fx, ThreadKey(2));
    assert_eq!(fx.registry.descriptors().len(), 2);
    mutator.release();
    assert_eq!(fx.registry.descriptors().len(), 1);
    assert!(fx.registry.descriptor(ThreadKey(2)).is_none());
}

#[test]
fn detach_of_unknown_thread_is_harmless() {
    let fx = discovery();
    let registry = Arc::clone(&fx.registry);
    thread::spawn(move || registry.on_thread_detach())
        .join()
        .unwrap();
    assert_eq!(fx.registry.descriptors().len(), 1);
}

#[test]
fn process_detach_forgets_everything() {
    let fx = discovery();
    fx.registry.on_process_detach();
    assert!(fx.registry.descriptors().is_empty());
    assert_eq!(fx.sim.open_handles(), 0);
}

#[test]
fn unregister_drives_incremental_cycle_to_completion() {
    let fx = explicit();
    let mutator = spawn_mutator(&fx, ThreadKey(2), |ctx| ctx.park());
    fx.engine.start_incremental(3);
    mutator.release();
    assert!(!fx.engine.is_collection_in_progress());
    assert_eq!(fx.engine.gc_number(), 1);
}

#[test]
fn spawned_thread_is_registered_while_running() {
    let fx = explicit();
    let registry = Arc::clone(&fx.registry);
    let handle = fx
        .registry
        .spawn(move || registry.is_current_thread_registered())
        .unwrap();
    assert!(handle.join().unwrap());
    assert_eq!(fx.registry.descriptors().len(), 1);
}

#[test]
fn panicking_spawned_thread_is_still_unregistered() {
    let fx = explicit();
    let handle = fx.registry.spawn(|| panic!("mutator failure")).unwrap();
    assert!(handle.join().is_err());
    assert_eq!(fx.registry.live_threads(), 1);
    assert_eq!(fx.registry.descriptors().len(), 1);
}

#[test]
fn detached_thread_is_reclaimed_when_it_finishes() {
    let fx = explicit();
    let (release_tx, release_rx) = bounded::<()>(1);
    let handle = fx
        .registry
        .spawn(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
    drop(handle);
    release_tx.send(()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while fx.registry.descriptors().len() > 1 {
        assert!(Instant::now() < deadline, "detached descriptor was not reclaimed");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn revived_descriptor_gets_new_incarnation() {
    let fx = explicit();
    let descriptor = fx.registry.descriptor(PRIMARY).unwrap();
    let before = descriptor.incarnation();
    fx.registry.unregister_current_thread().unwrap();
    assert!(matches!(
        fx.registry.unregister_current_thread(),
        Err(ThreadError::NotRegistered(_))
    ));
    fx.registry
        .register_current_thread(StackBase::new(stack_end_for(PRIMARY)))
        .unwrap();
    assert!(!descriptor.has(ThreadFlags::FINISHED));
    assert_eq!(descriptor.incarnation(), before + 1);
}

#[test]
fn blocking_call_round_trip() {
    let fx = explicit();
    fx.sim.set_sp(PRIMARY, stack_end_for(PRIMARY).sub(0x200));
    let descriptor = fx.registry.descriptor(PRIMARY).unwrap();
    let seen = fx
        .registry
        .enter_blocking_call(|| descriptor.flags())
        .unwrap();
    assert!(seen.contains(ThreadFlags::BLOCKING));
    assert!(!descriptor.has(ThreadFlags::BLOCKING));
    assert_eq!(descriptor.saved_stack_ptr(), stack_end_for(PRIMARY).sub(0x200));
}

#[test]
fn blocking_call_from_unregistered_thread_fails() {
    let fx = explicit();
    let registry = Arc::clone(&fx.registry);
    let result = thread::spawn(move || registry.enter_blocking_call(|| ()))
        .join()
        .unwrap();
    assert!(matches!(result, Err(ThreadError::NotRegistered(_))));
}
