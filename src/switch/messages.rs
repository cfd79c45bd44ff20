use bytes::{BufMut, Bytes, BytesMut};

use crate::config::ProtocolVersion;

const CONNECTION_REQUEST_TOKEN: &[u8; 32] = b"de8567de606e4a6db9c8292b703d8f6d";
const SWITCH_ACK_TOKEN: &[u8; 32] = b"5f1c7a0e2b9d4c3f8e6a1d7b0c9e2f4a";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    ConnectionRequest,
    SwitchAck,
    Unknown,
}

/// The fixed payloads of the switch handshake for a given protocol version. Recognition is by
///  exact byte equality, so peers with different versions do not understand each other.
#[derive(Debug, Clone)]
pub struct HandshakeMessages {
    connection_request: Bytes,
    switch_ack: Bytes,
}

impl HandshakeMessages {
    pub const SWITCH_OFFER_PORT_LEN: usize = size_of::<u16>();

    pub fn new(version: ProtocolVersion) -> HandshakeMessages {
        let mut connection_request = BytesMut::with_capacity(2 * size_of::<u16>() + CONNECTION_REQUEST_TOKEN.len());
        connection_request.put_u16_le(version.major);
        connection_request.put_u16_le(version.minor);
        connection_request.put_slice(CONNECTION_REQUEST_TOKEN);

        HandshakeMessages {
            connection_request: connection_request.freeze(),
            switch_ack: Bytes::from_static(SWITCH_ACK_TOKEN),
        }
    }

    pub fn connection_request(&self) -> &Bytes {
        &self.connection_request
    }

    pub fn switch_ack(&self) -> &Bytes {
        &self.switch_ack
    }

    pub fn classify(&self, datagram: &[u8]) -> HandshakeMessage {
        if datagram == self.connection_request.as_ref() {
            HandshakeMessage::ConnectionRequest
        }
        else if datagram == self.switch_ack.as_ref() {
            HandshakeMessage::SwitchAck
        }
        else {
            HandshakeMessage::Unknown
        }
    }

    /// A SwitchOffer is the connection request, echoed back with the offered port appended
    pub fn switch_offer(&self, port: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.connection_request.len() + Self::SWITCH_OFFER_PORT_LEN);
        buf.put_slice(&self.connection_request);
        buf.put_u16_le(port);
        buf.freeze()
    }

    /// Returns the offered port, or `None` if the datagram is not a valid SwitchOffer. Port 0 is
    ///  never a valid offer.
    pub fn parse_switch_offer(&self, datagram: &[u8]) -> Option<u16> {
        if datagram.len() != self.connection_request.len() + Self::SWITCH_OFFER_PORT_LEN {
            return None;
        }
        let (prefix, port) = datagram.split_at(self.connection_request.len());
        if prefix != self.connection_request.as_ref() {
            return None;
        }

        match u16::from_le_bytes([port[0], port[1]]) {
            0 => None,
            port => Some(port),
        }
    }
}
