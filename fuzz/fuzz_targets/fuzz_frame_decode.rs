//! Fuzz target for the realtime frame decoder.
//!
//! Arbitrary text must decode to a frame or a protocol error, never panic,
//! and decoded events must name a non-empty collection.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_sync::realtime::{collection_of, decode_frame, ServerFrame};

fuzz_target!(|data: &str| {
    if let Ok(ServerFrame::Event(event)) = decode_frame(data) {
        assert!(!event.collection_path.is_empty());
    }

    if let Some(collection) = collection_of(data) {
        assert!(!collection.is_empty());
        assert!(data.starts_with(collection));
    }
});
