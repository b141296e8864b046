//! Streaming packet decoder and writer-side encoder.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use super::{Magic, Packet, PacketType, HEADER_LEN, MAX_PAYLOAD};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad packet magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unknown packet type {0}")]
    UnknownType(u32),

    #[error("payload length {0} exceeds limit")]
    Oversized(usize),

    #[error("{ptype:?} payload has {got} fields, expected {expected}")]
    FieldCount {
        ptype: PacketType,
        expected: usize,
        got: usize,
    },

    #[error("non-utf8 text in {0:?} payload")]
    InvalidText(PacketType),

    #[error("unexpected {0:?} packet from peer")]
    Unexpected(PacketType),
}

/// Try to decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` on partial input, leaving the buffer untouched so the
/// caller can read more bytes. Errors are fatal for the connection.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let magic = match &buf[0..4] {
        m if m == &super::MAGIC_REQUEST[..] => Magic::Request,
        m if m == &super::MAGIC_RESPONSE[..] => Magic::Response,
        m => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(m);
            return Err(CodecError::BadMagic(raw));
        }
    };

    let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(CodecError::Oversized(len));
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    let ptype = PacketType::try_from(code)?;
    buf.advance(HEADER_LEN);
    let data = buf.split_to(len).to_vec();
    Ok(Some(Packet { magic, ptype, data }))
}

/// Serialize a packet into one exact-size buffer.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + packet.data.len());
    out.extend_from_slice(packet.magic.as_bytes());
    out.extend_from_slice(&(packet.ptype as u32).to_be_bytes());
    out.extend_from_slice(&(packet.data.len() as u32).to_be_bytes());
    out.extend_from_slice(&packet.data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_full_header() {
        let mut buf = BytesMut::from(&b"\0REQ\x00\x00"[..]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn decode_waits_for_full_payload() {
        let packet = Packet::request(PacketType::EchoReq, b"hello".to_vec());
        let wire = encode(&packet);
        let mut buf = BytesMut::from(&wire[..wire.len() - 2]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[wire.len() - 2..]);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = BytesMut::from(&b"GETX\x00\x00\x00\x01\x00\x00\x00\x00"[..]);
        assert!(matches!(decode(&mut buf), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\0REQ");
        buf.extend_from_slice(&16u32.to_be_bytes());
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decode(&mut buf), Err(CodecError::Oversized(_))));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\0REQ");
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(decode(&mut buf), Err(CodecError::UnknownType(5))));
    }

    #[test]
    fn consecutive_packets_decode_in_order() {
        let first = Packet::request(PacketType::CanDo, b"square".to_vec());
        let second = Packet::request(PacketType::GrabJob, Vec::new());
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&first));
        buf.extend_from_slice(&encode(&second));
        assert_eq!(decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), second);
        assert!(decode(&mut buf).unwrap().is_none());
    }
}
