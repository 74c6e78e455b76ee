//! Unit tests for stack and register root discovery

use super::*;
use gc_threads::arch::host_table;
use gc_threads::{Protection, ThreadError};

fn low_of(key: ThreadKey) -> Address {
    stack_end_for(key).sub(STACK_SIZE)
}

#[test]
fn suspended_thread_contributes_stack_and_registers() {
    let fx = explicit();
    let mutator = parked(&fx, ThreadKey(2));
    let register = host_table().registers.first().copied();
    if let Some(name) = register {
        fx.sim.set_register(ThreadKey(2), name, 0xdead_0000);
    }
    {
        let world = fx.registry.stop_the_world();
        let bytes = world.push_all_stacks();
        assert_eq!(bytes, 0x800 * 2);
    }
    let ranges = fx.engine.ranges();
    assert!(ranges.contains(&(initial_sp(PRIMARY), stack_end_for(PRIMARY))));
    assert!(ranges.contains(&(initial_sp(ThreadKey(2)), stack_end_for(ThreadKey(2)))));
    if register.is_some() {
        assert!(fx.engine.words().contains(&0xdead_0000));
    }
    assert_eq!(fx.registry.total_stack_size(), 0x1000);
    mutator.release();
}

#[test]
fn blocking_thread_is_scanned_from_saved_pointer() {
    let fx = explicit();
    let saved = stack_end_for(ThreadKey(2)).sub(0x300);
    let mutator = spawn_mutator(&fx, ThreadKey(2), move |ctx| {
        ctx.sim.set_sp(ctx.key, saved);
        ctx.registry
            .enter_blocking_call(|| {
                // Deeper frames of the external call are never scanned.
                ctx.sim.set_sp(ctx.key, saved.sub(0x4000));
                ctx.park();
            })
            .unwrap();
    });
    let _ = fx.registry.stop_the_world().push_all_stacks();
    assert!(fx
        .engine
        .ranges()
        .contains(&(saved, stack_end_for(ThreadKey(2)))));
    assert!(fx.engine.words().is_empty());
    mutator.release();
}

#[test]
fn traced_section_gap_is_skipped() {
    let fx = explicit();
    let end = stack_end_for(ThreadKey(2));
    let (outer, boundary, inner) = (end.sub(0x100), end.sub(0x800), end.sub(0x1000));
    let mutator = spawn_mutator(&fx, ThreadKey(2), move |ctx| {
        ctx.sim.set_sp(ctx.key, outer);
        ctx.registry
            .enter_blocking_call(|| {
                ctx.sim.set_sp(ctx.key, boundary);
                ctx.registry
                    .call_with_gc_active(|| {
                        ctx.sim.set_sp(ctx.key, inner);
                        ctx.park();
                    })
                    .unwrap();
            })
            .unwrap();
    });
    {
        let world = fx.registry.stop_the_world();
        world.push_all_stacks();
    }
    let ranges: Vec<_> = fx
        .engine
        .ranges()
        .into_iter()
        .filter(|(lo, _)| *lo >= low_of(ThreadKey(2)) && *lo < end)
        .collect();
    assert_eq!(ranges, vec![(inner, boundary), (outer, end)]);
    mutator.release();
}

#[test]
fn nested_traced_sections_split_the_stack_three_ways() {
    let fx = explicit();
    let end = stack_end_for(ThreadKey(2));
    let (outer, outer_boundary) = (end.sub(0x100), end.sub(0x800));
    let (middle, inner_boundary) = (end.sub(0xc00), end.sub(0x1400));
    let inner = end.sub(0x2000);
    let mutator = spawn_mutator(&fx, ThreadKey(2), move |ctx| {
        let (registry, sim, key) = (&ctx.registry, &ctx.sim, ctx.key);
        sim.set_sp(key, outer);
        registry
            .enter_blocking_call(|| {
                sim.set_sp(key, outer_boundary);
                registry
                    .call_with_gc_active(|| {
                        sim.set_sp(key, middle);
                        registry
                            .enter_blocking_call(|| {
                                sim.set_sp(key, inner_boundary);
                                registry
                                    .call_with_gc_active(|| {
                                        sim.set_sp(key, inner);
                                        ctx.park();
                                    })
                                    .unwrap();
                            })
                            .unwrap();
                    })
                    .unwrap();
            })
            .unwrap();
    });
    let descriptor = fx.registry.descriptor(ThreadKey(2)).unwrap();
    assert_eq!(descriptor.traced_sections().len(), 2);
    {
        let world = fx.registry.stop_the_world();
        world.push_all_stacks();
    }
    let ranges: Vec<_> = fx
        .engine
        .ranges()
        .into_iter()
        .filter(|(lo, _)| *lo >= low_of(ThreadKey(2)) && *lo < end)
        .collect();
    assert_eq!(
        ranges,
        vec![(inner, inner_boundary), (middle, outer_boundary), (outer, end)]
    );
    mutator.release();
}

/// Maps one more stack page below `low`, turning the old guard page into
/// stack, and returns the new low end.
fn grow_stack_below(fx: &Fixture, low: Address) -> Address {
    let page = 0x1000;
    let grown = low.sub(page);
    fx.sim
        .map_region(grown, page, Protection::READ | Protection::WRITE);
    fx.sim.map_region(
        grown.sub(page),
        page,
        Protection::READ | Protection::WRITE | Protection::GUARD,
    );
    grown
}

#[test]
fn suspended_thread_below_cached_minimum_lowers_it() {
    let fx = explicit();
    let key = ThreadKey(2);
    let mutator = parked(&fx, key);
    let descriptor = fx.registry.descriptor(key).unwrap();
    let _ = fx.registry.stop_the_world().push_all_stacks();
    assert_eq!(descriptor.last_stack_min(), low_of(key));

    let grown = grow_stack_below(&fx, low_of(key));
    let sp = low_of(key).sub(0x800);
    fx.sim.set_sp(key, sp);
    fx.engine.clear();
    let _ = fx.registry.stop_the_world().push_all_stacks();

    assert_eq!(descriptor.last_stack_min(), grown);
    assert!(fx.engine.ranges().contains(&(sp, stack_end_for(key))));
    mutator.release();
}

#[test]
fn collector_below_cached_minimum_lowers_it() {
    let fx = explicit();
    let descriptor = fx.registry.descriptor(PRIMARY).unwrap();
    {
        let guard = fx.registry.lock();
        fx.registry.push_all_stacks(&guard);
    }
    assert_eq!(descriptor.last_stack_min(), low_of(PRIMARY));

    let grown = grow_stack_below(&fx, low_of(PRIMARY));
    let sp = low_of(PRIMARY).sub(0x400);
    fx.sim.set_sp(PRIMARY, sp);
    fx.engine.clear();
    {
        let guard = fx.registry.lock();
        fx.registry.push_all_stacks(&guard);
    }

    assert_eq!(descriptor.last_stack_min(), grown);
    assert_eq!(fx.engine.ranges(), vec![(sp, stack_end_for(PRIMARY))]);
}

#[test]
fn out_of_range_pointer_pushes_whole_stack() {
    let fx = explicit();
    let mutator = parked(&fx, ThreadKey(2));
    fx.sim
        .set_sp(ThreadKey(2), stack_end_for(ThreadKey(2)).add(0x100));
    let _ = fx.registry.stop_the_world().push_all_stacks();
    assert!(fx
        .engine
        .ranges()
        .contains(&(low_of(ThreadKey(2)), stack_end_for(ThreadKey(2)))));
    mutator.release();
}

#[test]
fn stack_minimum_is_cached_and_tightened() {
    let fx = explicit();
    let descriptor = fx.registry.descriptor(PRIMARY).unwrap();
    {
        let guard = fx.registry.lock();
        fx.registry.push_all_stacks(&guard);
    }
    assert_eq!(descriptor.last_stack_min(), low_of(PRIMARY));

    {
        let guard = fx.registry.lock();
        fx.registry.push_all_stacks(&guard);
    }
    let min = descriptor.last_stack_min();
    assert!(min >= low_of(PRIMARY));
    assert!(min <= initial_sp(PRIMARY));
}

#[test]
fn push_from_unregistered_thread_is_rejected() {
    let fx = explicit();
    let registry = Arc::clone(&fx.registry);
    let result = thread::spawn(move || {
        let guard = registry.lock();
        registry.try_push_all_stacks(&guard)
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(ThreadError::UnknownCollector)));
}

#[test]
fn stacks_are_enumerated_in_address_order() {
    let fx = explicit();
    let mutator = parked(&fx, ThreadKey(2));
    {
        let guard = fx.registry.lock();
        let first = fx.registry.get_next_stack(Address::NULL, Address::LIMIT, &guard);
        assert_eq!(first, (low_of(PRIMARY), stack_end_for(PRIMARY)));
        let second = fx
            .registry
            .get_next_stack(stack_end_for(PRIMARY), Address::LIMIT, &guard);
        assert_eq!(second, (low_of(ThreadKey(2)), stack_end_for(ThreadKey(2))));
        let none = fx
            .registry
            .get_next_stack(stack_end_for(ThreadKey(2)), Address::LIMIT, &guard);
        assert_eq!(none, (Address::LIMIT, Address::LIMIT));
    }
    mutator.release();
}

#[test]
fn next_stack_beyond_unmapped_limit_is_not_queried() {
    let fx = explicit();
    let guard = fx.registry.lock();
    let limit = Address::new(0x1000);
    let result = fx.registry.get_next_stack(Address::NULL, limit, &guard);
    assert_eq!(result, (Address::LIMIT, stack_end_for(PRIMARY)));
}

#[test]
fn may_be_in_stack_checks_protection() {
    let fx = explicit();
    assert!(fx.registry.may_be_in_stack(initial_sp(PRIMARY)));
    assert!(!fx.registry.may_be_in_stack(low_of(PRIMARY).sub(1)));
    assert!(!fx.registry.may_be_in_stack(Address::new(0x10)));
}
