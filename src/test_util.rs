use std::net::SocketAddr;
use std::sync::Mutex;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::socket::DatagramSocket;

/// An in-memory socket for tests: inbound datagrams are injected through [FakeSocket::inject],
///  outbound datagrams are recorded.
pub struct FakeSocket {
    local_addr: SocketAddr,
    inbound_sender: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
    sent: Mutex<Vec<(Bytes, SocketAddr)>>,
}

impl FakeSocket {
    pub fn new(local_addr: SocketAddr) -> FakeSocket {
        let (inbound_sender, inbound) = mpsc::unbounded_channel();
        FakeSocket {
            local_addr,
            inbound_sender,
            inbound: tokio::sync::Mutex::new(inbound),
            sent: Default::default(),
        }
    }

    pub fn inject(&self, datagram: &[u8], from: SocketAddr) {
        self.inbound_sender.send((Bytes::copy_from_slice(datagram), from)).unwrap();
    }

    pub fn sent(&self) -> Vec<(Bytes, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self, datagram: &[u8]) -> usize {
        self.sent.lock().unwrap().iter()
            .filter(|(d, _)| d.as_ref() == datagram)
            .count()
    }
}

#[async_trait]
impl DatagramSocket for FakeSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((Bytes::copy_from_slice(buf), to));
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        match self.inbound.lock().await.recv().await {
            Some((datagram, from)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => bail!("socket closed"),
        }
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
