//! Fuzz target: raw frame reading
//!
//! Feeds random bytes to the frame reader. The reader must never panic, and
//! every frame it yields must re-encode to the exact bytes it was read from.

#![no_main]

use bytes::Bytes;
use h2mangle::{Frame, ReadEnd, parse_all, serialize};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let buffer = Bytes::copy_from_slice(data);
    let mut reader = parse_all(&buffer);
    let mut frames = Vec::new();
    for span in reader.by_ref() {
        match span {
            Ok(span) => frames.push(Frame::from_span(&buffer, &span)),
            Err(_) => break,
        }
    }

    let consumed = match reader.end() {
        Some(end) => end.consumed(buffer.len()),
        None => reader.position(),
    };
    let encoded = serialize(&frames).expect("frames read from the wire re-encode");
    assert_eq!(&encoded[..], &buffer[..consumed]);

    if let Some(ReadEnd::Clean) = reader.end() {
        assert_eq!(consumed, buffer.len());
    }
});
