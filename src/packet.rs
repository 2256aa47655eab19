use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{RudpError, RudpResult};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    Unreliable = 0,
    Reliable = 1,
    Ack = 2,
    /// Part of the wire format, but there is no handshake: a HELLO is processed like any
    ///  other packet
    Hello = 3,
}

/// A single datagram on the wire, see the crate documentation for the layout.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub seq: u16,
    pub ack: u16,
    pub payload: Bytes,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{:?}#{} ack:{} len:{}}}", self.kind, self.seq, self.ack, self.payload.len())
    }
}

impl Packet {
    pub const HEADER_LEN: usize = size_of::<u8>() + size_of::<u16>() + size_of::<u16>();

    pub fn unreliable(ack: u16, payload: impl Into<Bytes>) -> Packet {
        Packet { kind: PacketKind::Unreliable, seq: 0, ack, payload: payload.into() }
    }

    pub fn reliable(seq: u16, ack: u16, payload: impl Into<Bytes>) -> Packet {
        Packet { kind: PacketKind::Reliable, seq, ack, payload: payload.into() }
    }

    pub fn ack(acked_seq: u16) -> Packet {
        Packet { kind: PacketKind::Ack, seq: 0, ack: acked_seq, payload: Bytes::new() }
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        buf.put_u16_le(self.seq);
        buf.put_u16_le(self.ack);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// The payload is copied, so `buf` may be a receive buffer that is reused afterwards.
    pub fn deser(mut buf: &[u8]) -> RudpResult<Packet> {
        if buf.len() < Self::HEADER_LEN {
            return Err(RudpError::PacketTooSmall { len: buf.len() });
        }

        let raw_kind = buf.get_u8();
        let kind = PacketKind::try_from(raw_kind)
            .map_err(|_| RudpError::UnknownPacketKind(raw_kind))?;
        let seq = buf.get_u16_le();
        let ack = buf.get_u16_le();

        let payload = if buf.is_empty() {
            Bytes::new()
        }
        else {
            Bytes::copy_from_slice(buf)
        };

        Ok(Packet { kind, seq, ack, payload })
    }
}
