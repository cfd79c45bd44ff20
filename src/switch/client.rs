use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::channel::message_handler::{MessageHandler, ReceivedMessage};
use crate::channel::Channel;
use crate::config::SwitchClientConfig;
use crate::retry::RetryTransmitter;
use crate::socket::DatagramSocket;
use crate::switch::messages::HandshakeMessages;

/// The client side of the switch handshake. The socket bound here is used both for the handshake
///  and for the resulting channel.
pub struct SwitchClient {
    socket: Arc<dyn DatagramSocket>,
    config: SwitchClientConfig,
    messages: HandshakeMessages,
}

impl SwitchClient {
    pub async fn bind(config: SwitchClientConfig) -> anyhow::Result<SwitchClient> {
        config.validate()?;

        let socket = UdpSocket::bind(config.local_addr).await?;
        debug!("switch client bound to {:?}", DatagramSocket::local_addr(&socket)?);

        Ok(SwitchClient::new(Arc::new(socket), config))
    }

    fn new(socket: Arc<dyn DatagramSocket>, config: SwitchClientConfig) -> SwitchClient {
        SwitchClient {
            socket,
            messages: HandshakeMessages::new(config.protocol_version),
            config,
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Performs the handshake, returning a started channel to the port the server offered.
    ///
    /// ConnectionRequests are sent according to the configured retry policy; if none of them is
    ///  answered with a valid SwitchOffer, this fails.
    pub async fn connect(&self, message_handler: Arc<dyn MessageHandler>) -> anyhow::Result<Arc<Channel>> {
        let server_addr = self.config.server_addr;
        info!("connecting to switch server at {:?}", server_addr);

        let (timeout_sender, timeout_receiver) = oneshot::channel();
        let requests = CloseOnDrop(RetryTransmitter::spawn(
            self.socket.clone(),
            server_addr,
            self.messages.connection_request().clone(),
            self.config.retry_policy,
            move || { let _ = timeout_sender.send(()); },
        ));

        let offered_port = select! {
            _ = timeout_receiver => {
                bail!("no switch offer from {:?} after {} connection requests", server_addr, self.config.retry_policy.max_retries + 1);
            }
            offer = self.await_switch_offer() => {
                requests.0.close();
                offer?
            }
        };

        let channel_addr = SocketAddr::new(server_addr.ip(), offered_port);
        info!("switching to {:?}", channel_addr);

        self.send_switch_ack().await;

        let channel = Channel::new(
            self.socket.clone(),
            channel_addr,
            self.config.channel_config.clone(),
            Arc::new(SwitchAckingHandler {
                inner: message_handler,
                socket: self.socket.clone(),
                server_addr,
                messages: self.messages.clone(),
            }),
        )?;
        channel.start();
        Ok(Arc::new(channel))
    }

    async fn await_switch_offer(&self) -> anyhow::Result<u16> {
        let mut buf = [0u8; 1024];
        loop {
            let (num_read, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.config.server_addr {
                debug!("received datagram from {:?} while waiting for a switch offer - dropping", from);
                continue;
            }
            match self.messages.parse_switch_offer(&buf[..num_read]) {
                Some(port) => return Ok(port),
                None => debug!("received invalid switch offer from {:?} - dropping", from),
            }
        }
    }

    async fn send_switch_ack(&self) {
        // the server re-sends its offer if this is lost, and gets another ack then
        if let Err(e) = self.socket.send_to(self.messages.switch_ack(), self.config.server_addr).await {
            warn!("error sending switch ack to {:?}: {}", self.config.server_addr, e);
        }
    }
}

/// Stops the ConnectionRequests when `connect` returns or its future is dropped
struct CloseOnDrop(RetryTransmitter);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Answers repeated SwitchOffers on the established channel. They are not from the channel's
///  peer address, so they arrive as stray datagrams.
struct SwitchAckingHandler {
    inner: Arc<dyn MessageHandler>,
    socket: Arc<dyn DatagramSocket>,
    server_addr: SocketAddr,
    messages: HandshakeMessages,
}

#[async_trait]
impl MessageHandler for SwitchAckingHandler {
    async fn on_message(&self, msg: ReceivedMessage) {
        self.inner.on_message(msg).await
    }

    async fn on_stray_datagram(&self, from: SocketAddr, datagram: Bytes) {
        if from == self.server_addr && self.messages.parse_switch_offer(&datagram).is_some() {
            trace!("repeated switch offer from {:?} - sending another switch ack", from);
            if let Err(e) = self.socket.send_to(self.messages.switch_ack(), from).await {
                warn!("error sending switch ack to {:?}: {}", from, e);
            }
            return;
        }
        self.inner.on_stray_datagram(from, datagram).await
    }
}
