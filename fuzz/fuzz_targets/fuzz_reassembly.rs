#![no_main]

use libfuzzer_sys::fuzz_target;
use peerwire::core::partial::PartialPacket;

fuzz_target!(|data: &[u8]| {
    // Feed an arbitrary stream through the reassembler - test for panics and stalls
    let mut partial = PartialPacket::new(64 * 1024);
    let mut rest = data;
    while !rest.is_empty() {
        match partial.feed(rest) {
            Ok(used) => {
                assert!(used > 0, "feed made no progress");
                rest = &rest[used..];
                if partial.is_complete() {
                    let done = std::mem::replace(&mut partial, PartialPacket::new(64 * 1024));
                    if let Some(mut packet) = done.into_packet() {
                        while packet.extract::<Vec<u8>>().is_ok() {}
                    }
                }
            }
            Err(_) => break,
        }
    }
});
