use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
    pub struct FrameFlags: u8 {
        const ACK_REQUEST  = 0b0000_0001;
        const ACK_RESPONSE = 0b0000_0010;
        const MESSAGE      = 0b0000_0100;
        // bit 3 is reserved, higher bits are unassigned and preserved on parsing
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub id: u16,
}

impl Debug for FrameHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FRAME{{{:#04x}:{}}}", self.flags.bits(), self.id)
    }
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + size_of::<u16>();

    pub fn new(flags: FrameFlags, id: u16) -> FrameHeader {
        FrameHeader { flags, id }
    }

    /// The header of a reliable message that the receiver must acknowledge
    pub fn ack_request(id: u16) -> FrameHeader {
        FrameHeader::new(FrameFlags::ACK_REQUEST, id)
    }

    pub fn ack_response(id: u16) -> FrameHeader {
        FrameHeader::new(FrameFlags::ACK_RESPONSE, id)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(self.id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("frame of {} bytes is shorter than its header", buf.remaining());
        }
        let flags = FrameFlags::from_bits_retain(buf.get_u8());
        let id = buf.get_u16_le();
        Ok(FrameHeader { flags, id })
    }

    /// Serializes the header followed by the payload into a single datagram
    pub fn frame(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN + payload.len());
        self.ser(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }
}
