//! Fuzz target for checkpoint comparison.
//!
//! Comparison must never panic and must be a total order on arbitrary
//! strings.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_sync::checkpoint::compare_checkpoints;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str, &str)| {
    let (a, b, c) = data;

    assert_eq!(compare_checkpoints(a, a), Ordering::Equal);
    assert_eq!(compare_checkpoints(a, b), compare_checkpoints(b, a).reverse());
    assert_eq!(compare_checkpoints(a, b) == Ordering::Equal, a == b);

    if compare_checkpoints(a, b) != Ordering::Greater && compare_checkpoints(b, c) != Ordering::Greater {
        assert_ne!(compare_checkpoints(a, c), Ordering::Greater);
    }
});
