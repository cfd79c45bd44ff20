use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;

use crate::channel::frame::FrameHeader;

/// Fixed-interval retransmission: a datagram is sent once, then re-sent every `retry_wait` until
///  it is confirmed or `max_retries` re-sends were performed, i.e. there are at most
///  `max_retries + 1` sends in total.
///
/// NB: Timeouts are count-times-interval based rather than wall clock deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_wait: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retry_wait: Duration::from_millis(1000),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_wait: Duration, max_retries: u32) -> anyhow::Result<RetryPolicy> {
        let result = RetryPolicy { retry_wait, max_retries };
        result.validate()?;
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_wait.is_zero() {
            bail!("retry wait must be greater than zero");
        }
        Ok(())
    }

    /// The upper bound for the time between the first send and a timeout
    pub fn total_patience(&self) -> Duration {
        self.retry_wait * (self.max_retries + 1)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub retry_policy: RetryPolicy,

    /// Size of the receive buffer. Datagrams exceeding this are truncated by the OS, so it should
    ///  be at least as big as the biggest datagram the peer sends.
    ///
    /// The default is the maximum UDP payload over IPV4: `65535 - 20 - 8 = 65507`
    pub max_datagram_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            retry_policy: RetryPolicy::default(),
            max_datagram_size: 65507,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.retry_policy.validate()?;
        if self.max_datagram_size < FrameHeader::SERIALIZED_LEN {
            bail!("max datagram size {} is smaller than the frame header", self.max_datagram_size);
        }
        Ok(())
    }
}

/// The version that is part of every ConnectionRequest. Both sides must agree on it exactly,
///  otherwise handshake messages are not recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        }
    }
}

pub struct SwitchServerConfig {
    /// The well-known rendezvous address
    pub listen_addr: SocketAddr,
    /// IP address for binding per-peer sockets. Defaults to the IP of the listening socket.
    pub switch_ip: Option<IpAddr>,
    /// Cadence and patience for re-sending SwitchOffers
    pub retry_policy: RetryPolicy,
    /// Configuration of the channels that are handed to the application
    pub channel_config: ChannelConfig,
    pub protocol_version: ProtocolVersion,
}

impl SwitchServerConfig {
    pub fn new(listen_addr: SocketAddr) -> SwitchServerConfig {
        SwitchServerConfig {
            listen_addr,
            switch_ip: None,
            retry_policy: RetryPolicy::default(),
            channel_config: ChannelConfig::default(),
            protocol_version: ProtocolVersion::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.retry_policy.validate()?;
        self.channel_config.validate()
    }
}

pub struct SwitchClientConfig {
    /// The server's well-known rendezvous address
    pub server_addr: SocketAddr,
    /// Local bind address, typically with port 0. The socket bound here is used for the handshake
    ///  and afterwards for the established channel.
    pub local_addr: SocketAddr,
    /// Cadence and patience for re-sending ConnectionRequests
    pub retry_policy: RetryPolicy,
    pub channel_config: ChannelConfig,
    pub protocol_version: ProtocolVersion,
}

impl SwitchClientConfig {
    pub fn new(server_addr: SocketAddr) -> SwitchClientConfig {
        let local_ip: IpAddr = if server_addr.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        }
        else {
            std::net::Ipv6Addr::UNSPECIFIED.into()
        };

        SwitchClientConfig {
            server_addr,
            local_addr: SocketAddr::new(local_ip, 0),
            retry_policy: RetryPolicy::default(),
            channel_config: ChannelConfig::default(),
            protocol_version: ProtocolVersion::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_addr.port() == 0 {
            bail!("server address {:?} has no port", self.server_addr);
        }
        self.retry_policy.validate()?;
        self.channel_config.validate()
    }
}
