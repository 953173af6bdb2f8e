//! The bytes on the wire: a 9-byte registration prefix, a 1-byte keep-alive,
//! and `client_id||seq||opus` data packets. This module is pure data
//! transformation — no I/O — so it is fully unit-testable without a socket.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::CLIENT_ID_LEN;

pub type ClientId = uuid::Uuid;

pub const REGISTER_PREFIX: &[u8] = b"REGISTER:";
pub const KEEP_ALIVE_BYTE: u8 = 0x00;

const DATA_HEADER_LEN: usize = CLIENT_ID_LEN + 4;

/// Built by Encode, consumed by Sender.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub client_id: ClientId,
    pub seq: u32,
    pub opus: Bytes,
}

impl OutboundPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + self.opus.len());
        buf.put_slice(self.client_id.as_bytes());
        buf.put_u32(self.seq);
        buf.put_slice(&self.opus);
        buf.freeze()
    }
}

/// Sent once on connect, ahead of any data packets.
pub fn registration_packet(client_id: ClientId) -> Bytes {
    let mut buf = BytesMut::with_capacity(REGISTER_PREFIX.len() + CLIENT_ID_LEN);
    buf.put_slice(REGISTER_PREFIX);
    buf.put_slice(client_id.as_bytes());
    buf.freeze()
}

/// A parsed data packet, ready to be handed to the addressed sender's jitter
/// buffer. Does not carry `received_at` — the receiver stamps that at the
/// point of insertion, since parsing itself is a pure function of the bytes.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub sender: ClientId,
    pub seq: u32,
    pub opus: Bytes,
}

/// Why a datagram was not treated as a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dropped {
    /// Too short to be anything but a keep-alive or reflector noise.
    TooShort,
    /// First 16 bytes equal our own client id: the reflector echoed us back.
    SelfEcho,
}

/// Classify and parse a raw datagram received from the reflector.
pub fn classify(data: &[u8], local_id: ClientId) -> Result<InboundPacket, Dropped> {
    if data.len() < DATA_HEADER_LEN {
        return Err(Dropped::TooShort);
    }
    let sender_bytes: [u8; CLIENT_ID_LEN] = data[..CLIENT_ID_LEN]
        .try_into()
        .expect("slice length checked above");
    let sender = ClientId::from_bytes(sender_bytes);
    if sender == local_id {
        return Err(Dropped::SelfEcho);
    }
    let seq = u32::from_be_bytes(
        data[CLIENT_ID_LEN..DATA_HEADER_LEN]
            .try_into()
            .expect("slice length checked above"),
    );
    let opus = Bytes::copy_from_slice(&data[DATA_HEADER_LEN..]);
    Ok(InboundPacket { sender, seq, opus })
}

/// Modular "is `a` strictly later than `b`" using the signed half-space rule:
/// `a` is later than `b` iff `(a - b) mod 2^32` lies in `(0, 2^31)`.
pub fn seq_is_later(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < 0x8000_0000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_packet_layout() {
        let id = ClientId::from_bytes([7u8; 16]);
        let pkt = registration_packet(id);
        assert_eq!(pkt.len(), 9 + 16);
        assert_eq!(&pkt[..9], REGISTER_PREFIX);
        assert_eq!(&pkt[9..], id.as_bytes());
    }

    #[test]
    fn round_trip_data_packet() {
        let id = ClientId::from_bytes([3u8; 16]);
        let out = OutboundPacket {
            client_id: id,
            seq: 42,
            opus: Bytes::from_static(b"hello-opus"),
        };
        let raw = out.encode();
        let other = ClientId::from_bytes([9u8; 16]);
        let parsed = classify(&raw, other).expect("should parse as data packet");
        assert_eq!(parsed.sender, id);
        assert_eq!(parsed.seq, 42);
        assert_eq!(&parsed.opus[..], b"hello-opus");
    }

    #[test]
    fn too_short_is_dropped() {
        let id = ClientId::from_bytes([1u8; 16]);
        assert!(matches!(classify(&[0u8; 19], id), Err(Dropped::TooShort)));
        assert!(matches!(classify(&[], id), Err(Dropped::TooShort)));
    }

    #[test]
    fn self_echo_is_dropped() {
        let id = ClientId::from_bytes([1u8; 16]);
        let out = OutboundPacket {
            client_id: id,
            seq: 1,
            opus: Bytes::from_static(b"x"),
        };
        let raw = out.encode();
        assert!(matches!(classify(&raw, id), Err(Dropped::SelfEcho)));
    }

    #[test]
    fn seq_wraps_at_u32_max() {
        assert!(seq_is_later(0, 0xFFFF_FFFF));
        assert!(!seq_is_later(0xFFFF_FFFF, 0));
        assert!(seq_is_later(5, 4));
        assert!(!seq_is_later(4, 5));
        assert!(!seq_is_later(4, 4));
    }
}
