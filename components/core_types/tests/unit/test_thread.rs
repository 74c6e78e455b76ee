use core_types::{OsHandle, ThreadKey};
use std::collections::HashSet;

#[test]
fn test_thread_key_none() {
    assert!(!ThreadKey::NONE.is_some());
    assert!(ThreadKey(7).is_some());
}

#[test]
fn test_thread_key_hashable() {
    let keys: HashSet<ThreadKey> = [ThreadKey(1), ThreadKey(2), ThreadKey(1)].into_iter().collect();
    assert_eq!(keys.len(), 2);
}

#[test]
fn test_os_handle_validity() {
    assert!(!OsHandle::INVALID.is_valid());
    assert!(OsHandle(3).is_valid());
}
