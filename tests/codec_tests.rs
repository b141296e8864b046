//! Wire codec round-trip and framing tests.

use bytes::BytesMut;
use geard::protocol::{decode, encode, Magic, Packet, PacketType};

fn round_trip(packet: Packet) {
    let wire = encode(&packet);
    let mut buf = BytesMut::from(&wire[..]);
    let decoded = decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, packet);
    assert!(buf.is_empty());
}

#[test]
fn well_formed_packets_round_trip() {
    round_trip(Packet::request(PacketType::CanDo, b"resize".to_vec()));
    round_trip(Packet::request(PacketType::GrabJob, Vec::new()));
    round_trip(Packet::request(
        PacketType::SubmitJob,
        Packet::join(&[b"square", b"uid-1", b"5"]),
    ));
    round_trip(Packet::response(
        PacketType::JobAssign,
        Packet::join(&[b"H:host:1", b"square", b"5"]),
    ));
    round_trip(Packet::response(
        PacketType::JobAssignUniq,
        Packet::join(&[b"H:host:2", b"square", b"uid-1", b"5"]),
    ));
    round_trip(Packet::response(
        PacketType::StatusRes,
        Packet::join(&[b"H:host:3", b"1", b"0", b"0", b"0"]),
    ));
    round_trip(Packet::request(PacketType::EchoReq, vec![0, 1, 2, 255]));
}

#[test]
fn binary_payloads_survive_round_trip() {
    // Payload bytes are opaque, including NULs and the magic itself.
    let payload = Packet::join(&[b"H:host:9", b"\0REQ\x01\x02\x00\xff"]);
    round_trip(Packet::request(PacketType::WorkComplete, payload));
}

#[test]
fn header_magic_selects_direction() {
    let request = encode(&Packet::request(PacketType::Noop, Vec::new()));
    assert_eq!(&request[..4], b"\0REQ");
    let response = encode(&Packet::response(PacketType::Noop, Vec::new()));
    assert_eq!(&response[..4], b"\0RES");

    let mut buf = BytesMut::from(&response[..]);
    let decoded = decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded.magic, Magic::Response);
}

#[test]
fn type_and_length_are_big_endian() {
    let wire = encode(&Packet::request(PacketType::SubmitJob, b"abc".to_vec()));
    assert_eq!(&wire[4..8], &7u32.to_be_bytes());
    assert_eq!(&wire[8..12], &3u32.to_be_bytes());
    assert_eq!(wire.len(), 15);
}

#[test]
fn partial_feeds_decode_once_complete() {
    let packet = Packet::request(
        PacketType::SubmitJobBg,
        Packet::join(&[b"fn", b"uid", b"payload"]),
    );
    let wire = encode(&packet);

    let mut buf = BytesMut::new();
    for chunk in wire.chunks(3) {
        let before = decode(&mut buf).unwrap();
        assert!(before.is_none() || buf.is_empty());
        buf.extend_from_slice(chunk);
    }
    assert_eq!(decode(&mut buf).unwrap().unwrap(), packet);
}

#[test]
fn garbage_magic_is_fatal() {
    let mut buf = BytesMut::from(&b"status\n\0\0\0\0\0"[..]);
    assert!(decode(&mut buf).is_err());
}
