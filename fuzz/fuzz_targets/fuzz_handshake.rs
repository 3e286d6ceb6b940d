#![no_main]

use libfuzzer_sys::fuzz_target;
use peerwire::protocol::handshake;
use peerwire::protocol::security::Security;
use peerwire::Packet;

fuzz_target!(|data: &[u8]| {
    // Answer an arbitrary opening message; only well-formed keys may succeed
    let mut frame = ((data.len() + 4) as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(data);
    let Ok(mut opening) = Packet::from_frame(frame) else {
        return;
    };

    let mut server = Security::new();
    if handshake::respond(&mut server, &mut opening).is_ok() {
        assert!(server.is_ready());
    }
});
