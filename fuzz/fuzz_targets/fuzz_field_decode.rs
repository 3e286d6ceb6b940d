#![no_main]

use libfuzzer_sys::fuzz_target;
use peerwire::core::field::decode_field;

fuzz_target!(|data: &[u8]| {
    // A decoded field must lie inside the input it came from
    if let Ok((text, used)) = decode_field(data) {
        assert!(used <= data.len());
        assert!(text.len() < used);
    }
});
