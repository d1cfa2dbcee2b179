//! Fuzz target for the SSE record splitter.
//!
//! Feeding a body in arbitrary chunks must yield exactly the records that
//! feeding it in one piece yields.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_sync::realtime::SseDecoder;

fuzz_target!(|data: (&[u8], Vec<u8>)| {
    let (body, cuts) = data;

    let mut whole = SseDecoder::new();
    let expected = whole.feed(body);

    let mut chunked = SseDecoder::new();
    let mut records = Vec::new();
    let mut rest = body;
    for cut in cuts {
        if rest.is_empty() {
            break;
        }
        let at = (cut as usize) % (rest.len() + 1);
        let (chunk, tail) = rest.split_at(at);
        records.extend(chunked.feed(chunk));
        rest = tail;
    }
    records.extend(chunked.feed(rest));

    assert_eq!(records, expected);
    assert_eq!(chunked.buffered(), whole.buffered());
});
