use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::debug;

/// This is an abstraction over an unreliable, unordered, message oriented socket, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()>;

    /// Blocks until a datagram arrives, returning its length and source
    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        let num_sent = UdpSocket::send_to(self, buf, to).await?;
        if num_sent != buf.len() {
            anyhow::bail!("sent only {} of {} bytes to {:?}", num_sent, buf.len(), to);
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}

/// Binds a fresh socket to an OS assigned port
pub async fn bind_ephemeral(ip: IpAddr) -> anyhow::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
    debug!("bound ephemeral socket to {:?}", socket.local_addr()?);
    Ok(socket)
}
