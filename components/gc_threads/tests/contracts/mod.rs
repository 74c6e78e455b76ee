//! Contract tests for gc_threads
//!
//! These tests pin down the behaviour every implementation of the public
//! traits must share, and the cross-component protocols (parallel marking,
//! fork handling) as seen from the registry's public API.
