//! Property-based tests using proptest
//!
//! These tests check the wire format's invariants across randomly generated
//! field sequences and byte streams.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerwire::core::field::{decode_field, encode_field, encoded_len};
use peerwire::core::partial::PartialPacket;
use peerwire::core::HEADER_SIZE;
use peerwire::protocol::handshake;
use peerwire::protocol::security::Security;
use peerwire::Packet;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Field {
    Int(i64),
    Unsigned(u32),
    Byte(i8),
    Short(u16),
    Wide(i128),
    Flag(bool),
    Text(String),
    Raw(Vec<u8>),
}

fn field_strategy() -> impl Strategy<Value = Field> {
    prop_oneof![
        any::<i64>().prop_map(Field::Int),
        any::<u32>().prop_map(Field::Unsigned),
        any::<i8>().prop_map(Field::Byte),
        any::<u16>().prop_map(Field::Short),
        any::<i128>().prop_map(Field::Wide),
        any::<bool>().prop_map(Field::Flag),
        ".{0,64}".prop_map(Field::Text),
        prop::collection::vec(any::<u8>(), 0..256).prop_map(Field::Raw),
    ]
}

fn build(fields: &[Field]) -> Packet {
    let mut packet = Packet::new();
    for field in fields {
        let appended = match field {
            Field::Int(v) => packet.append(*v),
            Field::Unsigned(v) => packet.append(*v),
            Field::Byte(v) => packet.append(*v),
            Field::Short(v) => packet.append(*v),
            Field::Wide(v) => packet.append(*v),
            Field::Flag(v) => packet.append(*v),
            Field::Text(v) => packet.append(v.as_str()),
            Field::Raw(v) => packet.append(v.as_slice()),
        };
        appended.unwrap();
    }
    packet.finalize().unwrap();
    packet
}

fn check_fields(packet: &mut Packet, fields: &[Field]) -> Result<(), TestCaseError> {
    for field in fields {
        match field {
            Field::Int(v) => prop_assert_eq!(packet.extract::<i64>().unwrap(), *v),
            Field::Unsigned(v) => prop_assert_eq!(packet.extract::<u32>().unwrap(), *v),
            Field::Byte(v) => prop_assert_eq!(packet.extract::<i8>().unwrap(), *v),
            Field::Short(v) => prop_assert_eq!(packet.extract::<u16>().unwrap(), *v),
            Field::Wide(v) => prop_assert_eq!(packet.extract::<i128>().unwrap(), *v),
            Field::Flag(v) => prop_assert_eq!(packet.extract::<bool>().unwrap(), *v),
            Field::Text(v) => prop_assert_eq!(&packet.extract::<String>().unwrap(), v),
            Field::Raw(v) => prop_assert_eq!(&packet.extract::<Vec<u8>>().unwrap(), v),
        }
    }
    prop_assert_eq!(packet.remaining(), 0);
    Ok(())
}

// Property: fields come back in order, with the header counting the whole frame
proptest! {
    #[test]
    fn prop_fields_extract_in_order(fields in prop::collection::vec(field_strategy(), 0..20)) {
        let mut packet = build(&fields);

        let declared = u32::from_be_bytes(packet.as_bytes()[..HEADER_SIZE].try_into().unwrap());
        prop_assert_eq!(declared as usize, packet.len());

        check_fields(&mut packet, &fields)?;
    }
}

// Property: encoded_len agrees with what encode_field writes, and decode inverts it
proptest! {
    #[test]
    fn prop_field_codec_consistent(text in prop::collection::vec(any::<u8>(), 0..2048)) {
        let mut out = Vec::new();
        encode_field(&text, &mut out);
        prop_assert_eq!(out.len(), encoded_len(text.len()));

        let (decoded, used) = decode_field(&out).unwrap();
        prop_assert_eq!(decoded, text.as_slice());
        prop_assert_eq!(used, out.len());
    }
}

// Property: however a stream of frames is split into reads, reassembly
// yields the same frames
proptest! {
    #[test]
    fn prop_reassembly_independent_of_chunking(
        packets in prop::collection::vec(prop::collection::vec(field_strategy(), 0..6), 1..8),
        chunk in 1usize..64,
    ) {
        let built: Vec<Packet> = packets.iter().map(|f| build(f)).collect();
        let stream: Vec<u8> = built.iter().flat_map(|p| p.as_bytes().to_vec()).collect();

        let mut rebuilt = Vec::new();
        let mut partial = PartialPacket::new(1 << 20);
        for piece in stream.chunks(chunk) {
            let mut piece = piece;
            while !piece.is_empty() {
                let used = partial.feed(piece).unwrap();
                piece = &piece[used..];
                if partial.is_complete() {
                    let done = std::mem::replace(&mut partial, PartialPacket::new(1 << 20));
                    rebuilt.push(done.into_packet().unwrap());
                }
            }
        }

        prop_assert_eq!(rebuilt.len(), built.len());
        for (mut got, fields) in rebuilt.into_iter().zip(&packets) {
            check_fields(&mut got, fields)?;
        }
    }
}

// Property: the reassembler never panics on arbitrary bytes
proptest! {
    #[test]
    fn prop_reassembler_survives_garbage(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut partial = PartialPacket::new(4096);
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            match partial.feed(rest) {
                Ok(used) => {
                    rest = &rest[used..];
                    if partial.is_complete() {
                        partial = PartialPacket::new(4096);
                    }
                }
                Err(_) => break,
            }
        }
    }
}

// Property: extracting from an arbitrary frame never panics
proptest! {
    #[test]
    fn prop_extract_survives_garbage(body in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut frame = ((HEADER_SIZE + body.len()) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        let mut packet = Packet::from_frame(frame).unwrap();
        for _ in 0..8 {
            if packet.extract::<Vec<u8>>().is_err() {
                break;
            }
        }
    }
}

// Property: sealed frames open to exactly the original frame
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn prop_encryption_preserves_frame(fields in prop::collection::vec(field_strategy(), 0..10)) {
        let mut client = Security::new();
        let mut server = Security::new();
        let mut opening = handshake::opening_packet(&client).unwrap();
        let mut reply = handshake::respond(&mut server, &mut opening).unwrap();
        handshake::complete(&mut client, &mut reply).unwrap();

        let packet = build(&fields);
        let sealed = packet.to_encrypted(&client).unwrap();
        let mut opened = sealed.from_encrypted(&server).unwrap();
        prop_assert_eq!(opened.as_bytes(), packet.as_bytes());
        check_fields(&mut opened, &fields)?;
    }
}
