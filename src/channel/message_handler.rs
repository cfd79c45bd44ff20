use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::debug;

use crate::channel::frame::{FrameFlags, FrameHeader};

/// A datagram that arrived at a channel from its remote peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub from: SocketAddr,
    pub flags: FrameFlags,
    pub id: u16,
    /// the complete datagram, including the frame header
    pub datagram: Bytes,
}

impl ReceivedMessage {
    /// The datagram without the frame header
    pub fn payload(&self) -> Bytes {
        self.datagram.slice(FrameHeader::SERIALIZED_LEN..)
    }
}

/// Application callback for a [crate::channel::Channel]. Callbacks are invoked on separate tasks,
///  so they may take their time without blocking the receive loop - but there is no guarantee
///  regarding the order in which they run.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, msg: ReceivedMessage);

    /// Called for datagrams that arrive on the channel's socket from an address other than the
    ///  remote peer. These get no frame processing at all.
    async fn on_stray_datagram(&self, from: SocketAddr, datagram: Bytes) {
        debug!("dropping stray datagram of {} bytes from {:?}", datagram.len(), from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_strips_frame_header() {
        let msg = ReceivedMessage {
            from: SocketAddr::from(([10,0,0,2], 5000)),
            flags: FrameFlags::ACK_REQUEST,
            id: 9,
            datagram: FrameHeader::ack_request(9).frame(b"abc"),
        };
        assert_eq!(msg.datagram.len(), FrameHeader::SERIALIZED_LEN + 3);
        assert_eq!(msg.payload().as_ref(), b"abc");
    }
}
