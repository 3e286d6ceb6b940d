// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::core::packet::Packet;
use crate::core::partial::PartialPacket;
use crate::error::ProtocolError;
use crate::protocol::handshake::*;
use crate::protocol::security::Security;

const MAX: usize = 1 << 20;

/// Split a byte stream into frames the way a connection would.
fn reassemble(mut stream: &[u8]) -> Vec<Packet> {
    let mut frames = Vec::new();
    let mut partial = PartialPacket::new(MAX);
    while !stream.is_empty() {
        let used = partial.feed(stream).expect("stream should be well formed");
        stream = &stream[used..];
        if partial.is_complete() {
            let done = std::mem::replace(&mut partial, PartialPacket::new(MAX));
            frames.push(done.into_packet().unwrap());
        }
    }
    frames
}

fn exchange() -> (Security, Security) {
    // =================== Client opens ===================
    let mut client = Security::new();
    let opening = opening_packet(&client).expect("opening should build");
    let wire = opening.into_frame();

    // =================== Server answers ===================
    let mut server = Security::new();
    let mut received = reassemble(&wire);
    assert_eq!(received.len(), 1);
    let reply = respond(&mut server, &mut received[0]).expect("server should answer");
    assert!(server.is_ready());

    // =================== Client completes ===================
    let mut received = reassemble(&reply.into_frame());
    complete(&mut client, &mut received[0]).expect("client should complete");
    assert!(client.is_ready());

    (client, server)
}

fn message(text: &str, n: i64) -> Packet {
    let mut packet = Packet::new();
    packet.append(text).unwrap().append(n).unwrap();
    packet.finalize().unwrap();
    packet
}

#[test]
fn test_exchange_then_sealed_traffic_both_ways() {
    let (client, server) = exchange();

    let sealed = message("hej", 8_000_000_000).to_encrypted(&client).unwrap();
    let mut frames = reassemble(&sealed.into_frame());
    let mut opened = frames.remove(0).from_encrypted(&server).unwrap();
    assert_eq!(opened.extract::<String>().unwrap(), "hej");
    assert_eq!(opened.extract::<i64>().unwrap(), 8_000_000_000);

    let sealed = message("tack", -1).to_encrypted(&server).unwrap();
    let mut frames = reassemble(&sealed.into_frame());
    let mut opened = frames.remove(0).from_encrypted(&client).unwrap();
    assert_eq!(opened.extract::<String>().unwrap(), "tack");
    assert_eq!(opened.extract::<i64>().unwrap(), -1);
}

#[test]
fn test_reply_and_first_message_in_one_read() {
    // The server may send data right behind its reply; the client must
    // finish the exchange with the first frame and decrypt the rest.
    let mut client = Security::new();
    let mut server = Security::new();
    let mut opening = opening_packet(&client).unwrap();
    let reply = respond(&mut server, &mut opening).unwrap();
    let follow_up = message("welcome", 1).to_encrypted(&server).unwrap();

    let mut stream = reply.as_bytes().to_vec();
    stream.extend_from_slice(follow_up.as_bytes());

    let mut frames = reassemble(&stream).into_iter();
    complete(&mut client, &mut frames.next().unwrap()).unwrap();
    let mut opened = frames.next().unwrap().from_encrypted(&client).unwrap();
    assert_eq!(opened.extract::<String>().unwrap(), "welcome");
    assert!(frames.next().is_none());
}

#[test]
fn test_many_messages_keep_order() {
    let (client, server) = exchange();
    let mut stream = Vec::new();
    for i in 0..50 {
        let sealed = message("seq", i).to_encrypted(&client).unwrap();
        stream.extend_from_slice(sealed.as_bytes());
    }

    let frames = reassemble(&stream);
    assert_eq!(frames.len(), 50);
    for (i, frame) in frames.into_iter().enumerate() {
        let mut opened = frame.from_encrypted(&server).unwrap();
        opened.extract::<String>().unwrap();
        assert_eq!(opened.extract::<i64>().unwrap(), i as i64);
    }
}

#[test]
fn test_sealed_frame_cannot_cross_sessions() {
    let (client_a, _server_a) = exchange();
    let (_client_b, server_b) = exchange();

    let sealed = message("private", 7).to_encrypted(&client_a).unwrap();
    assert!(matches!(
        sealed.from_encrypted(&server_b),
        Err(ProtocolError::DecryptionFailure)
    ));
}

#[test]
fn test_plaintext_frame_after_exchange_rejected() {
    let (_client, server) = exchange();
    let plain = message("unsealed", 0);
    let err = plain.from_encrypted(&server).unwrap_err();
    assert!(err.is_cryptographic());
}

#[test]
fn test_replayed_opening_against_new_session() {
    // Answering the same opening twice yields two unrelated content keys.
    let mut client = Security::new();
    let opening = opening_packet(&client).unwrap();

    let mut server_a = Security::new();
    let mut server_b = Security::new();
    let reply_a = respond(&mut server_a, &mut opening.clone()).unwrap();
    let _reply_b = respond(&mut server_b, &mut opening.clone()).unwrap();

    complete(&mut client, &mut reply_a.clone()).unwrap();
    let sealed = message("for a", 1).to_encrypted(&client).unwrap();
    assert!(sealed.from_encrypted(&server_a).is_ok());
    assert!(sealed.from_encrypted(&server_b).is_err());
}

#[test]
fn test_garbage_opening_rejected() {
    let mut server = Security::new();
    let mut bogus = Packet::new();
    bogus.append("not a key").unwrap().append("also not").unwrap();
    bogus.finalize().unwrap();
    assert!(respond(&mut server, &mut bogus).is_err());
    assert!(!server.is_ready());
}
