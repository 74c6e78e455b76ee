use core_types::{approximate_sp, with_stack_base, Address, StackBase};

#[test]
fn test_address_ordering() {
    let low = Address::new(0x1000);
    let high = Address::new(0x2000);
    assert!(low < high);
    assert_eq!(high.distance_from(low), 0x1000);
    assert_eq!(low.add(0x1000), high);
    assert_eq!(high.sub(0x1000), low);
}

#[test]
fn test_address_formatting() {
    assert_eq!(format!("{}", Address::new(0xbeef)), "0xbeef");
    assert_eq!(format!("{:?}", Address::new(16)), "0x10");
}

#[test]
fn test_stack_base_null() {
    assert!(StackBase::new(Address::NULL).is_null());
    assert!(!StackBase::new(Address::new(0x8000)).is_null());
}

#[test]
fn test_nested_frames_are_lower() {
    with_stack_base(|outer| {
        with_stack_base(|inner| {
            assert!(inner.mem_base <= outer.mem_base);
            assert!(approximate_sp() < inner.mem_base);
        })
    });
}
