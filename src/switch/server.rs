use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::channel::message_handler::MessageHandler;
use crate::channel::Channel;
use crate::config::SwitchServerConfig;
use crate::retry::RetryTransmitter;
use crate::socket::{bind_ephemeral, DatagramSocket};
use crate::switch::messages::{HandshakeMessage, HandshakeMessages};

/// Application callback for a [SwitchServer]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Provides the handler for a new peer's channel. This is called when the peer's first
    ///  ConnectionRequest arrives, i.e. before it is known whether the handshake will complete.
    fn message_handler_for(&self, peer_addr: SocketAddr) -> Arc<dyn MessageHandler>;

    /// Called with a started channel when a peer completed the handshake
    async fn on_connection_established(&self, channel: Arc<Channel>);
}

enum Session {
    Offering {
        offer_id: u64,
        channel: Channel,
        transmitter: RetryTransmitter,
    },
    Established(Weak<Channel>),
}

impl Session {
    /// An established session whose channel is gone does not count
    fn is_live(&self) -> bool {
        match self {
            Session::Offering { .. } => true,
            Session::Established(channel) => channel.upgrade().is_some_and(|c| c.is_running()),
        }
    }
}

struct SwitchServerShared {
    socket: Arc<dyn DatagramSocket>,
    switch_ip: IpAddr,
    config: SwitchServerConfig,
    messages: HandshakeMessages,
    connection_handler: Arc<dyn ConnectionHandler>,
    sessions: Mutex<FxHashMap<SocketAddr, Session>>,
    offer_counter: AtomicU64,
}

impl SwitchServerShared {
    fn lock_sessions(&self) -> MutexGuard<'_, FxHashMap<SocketAddr, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes established sessions whose channel was stopped or dropped
    fn prune_closed_sessions(sessions: &mut FxHashMap<SocketAddr, Session>) {
        sessions.retain(|peer_addr, session| {
            let live = session.is_live();
            if !live {
                trace!("discarding closed session with {:?}", peer_addr);
            }
            live
        });
    }

    async fn on_datagram(self: &Arc<Self>, from: SocketAddr, datagram: &[u8]) {
        match self.messages.classify(datagram) {
            HandshakeMessage::ConnectionRequest => self.on_connection_request(from).await,
            HandshakeMessage::SwitchAck => self.on_switch_ack(from),
            HandshakeMessage::Unknown => {
                debug!("received unrecognized datagram of {} bytes from {:?} - dropping", datagram.len(), from);
            }
        }
    }

    async fn on_connection_request(self: &Arc<Self>, from: SocketAddr) {
        {
            let mut sessions = self.lock_sessions();
            Self::prune_closed_sessions(&mut sessions);
            match sessions.get(&from) {
                Some(Session::Offering { transmitter, .. }) => {
                    debug!("repeated connection request from {:?} - extending the offer", from);
                    transmitter.reset_retry_count();
                    return;
                }
                Some(session) if session.is_live() => {
                    debug!("connection request from {:?}, which is already connected - ignoring", from);
                    return;
                }
                _ => {}
            }
        }

        // NB: the lock is not held while binding
        let switch_socket = match bind_ephemeral(self.switch_ip).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("error binding a socket for {:?}: {}", from, e);
                return;
            }
        };
        let switch_port = match DatagramSocket::local_addr(&switch_socket) {
            Ok(addr) => addr.port(),
            Err(e) => {
                error!("bound socket for {:?} has no local address: {}", from, e);
                return;
            }
        };

        let channel = match Channel::new(
            Arc::new(switch_socket),
            from,
            self.config.channel_config.clone(),
            self.connection_handler.message_handler_for(from),
        ) {
            Ok(channel) => channel,
            Err(e) => {
                error!("error creating channel for {:?}: {}", from, e);
                return;
            }
        };

        info!("offering port {} to {:?}", switch_port, from);

        let offer_id = self.offer_counter.fetch_add(1, Ordering::AcqRel);
        let weak_self = Arc::downgrade(self);

        let mut sessions = self.lock_sessions();
        let transmitter = RetryTransmitter::spawn(
            self.socket.clone(),
            from,
            self.messages.switch_offer(switch_port),
            self.config.retry_policy,
            move || {
                if let Some(shared) = weak_self.upgrade() {
                    shared.on_offer_timeout(from, offer_id);
                }
            },
        );
        sessions.insert(from, Session::Offering {
            offer_id,
            channel,
            transmitter,
        });
    }

    fn on_switch_ack(self: &Arc<Self>, from: SocketAddr) {
        let channel = {
            let mut sessions = self.lock_sessions();
            Self::prune_closed_sessions(&mut sessions);
            match sessions.remove(&from) {
                Some(Session::Offering { channel, transmitter, .. }) => {
                    if !transmitter.close() {
                        debug!("switch ack from {:?} arrived after the offer timed out", from);
                        return;
                    }
                    // started before it is registered, so the session is live as soon as it is visible
                    channel.start();
                    let channel = Arc::new(channel);
                    sessions.insert(from, Session::Established(Arc::downgrade(&channel)));
                    channel
                }
                Some(established) => {
                    trace!("repeated switch ack from {:?} - ignoring", from);
                    sessions.insert(from, established);
                    return;
                }
                None => {
                    debug!("switch ack from {:?} without a pending offer - ignoring", from);
                    return;
                }
            }
        };

        info!("connection to {:?} established", from);

        let connection_handler = self.connection_handler.clone();
        tokio::spawn(async move { connection_handler.on_connection_established(channel).await });
    }

    fn on_offer_timeout(&self, from: SocketAddr, offer_id: u64) {
        let mut sessions = self.lock_sessions();
        if let Some(Session::Offering { offer_id: current, .. }) = sessions.get(&from) {
            if *current == offer_id {
                info!("{:?} did not accept the offered port - discarding", from);
                // dropping the unstarted channel releases its socket
                sessions.remove(&from);
            }
        }
    }
}

/// The server side of the switch handshake: listens on a well-known address and moves every new
///  peer to a [Channel] on a port of its own.
pub struct SwitchServer {
    shared: Arc<SwitchServerShared>,
    shutdown: watch::Sender<bool>,
}

impl SwitchServer {
    pub async fn bind(config: SwitchServerConfig, connection_handler: Arc<dyn ConnectionHandler>) -> anyhow::Result<SwitchServer> {
        config.validate()?;

        let socket = UdpSocket::bind(config.listen_addr).await?;
        let local_addr = DatagramSocket::local_addr(&socket)?;
        info!("switch server listening on {:?}", local_addr);

        Ok(SwitchServer::new(Arc::new(socket), local_addr.ip(), config, connection_handler))
    }

    fn new(socket: Arc<dyn DatagramSocket>, listen_ip: IpAddr, config: SwitchServerConfig, connection_handler: Arc<dyn ConnectionHandler>) -> SwitchServer {
        let (shutdown, _) = watch::channel(false);
        SwitchServer {
            shared: Arc::new(SwitchServerShared {
                socket,
                switch_ip: config.switch_ip.unwrap_or(listen_ip),
                messages: HandshakeMessages::new(config.protocol_version),
                config,
                connection_handler,
                sessions: Default::default(),
                offer_counter: AtomicU64::new(0),
            }),
            shutdown,
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Number of peers that were offered a port and did not accept it yet
    pub fn offering_count(&self) -> usize {
        self.shared.lock_sessions().values()
            .filter(|s| matches!(s, Session::Offering { .. }))
            .count()
    }

    /// Runs the receive loop until the server is stopped, or until the socket fails
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        info!("starting switch server receive loop");

        // handshake messages are small, anything bigger than an offer is not a handshake message
        let mut buf = [0u8; 1024];
        loop {
            let (num_read, from) = select! {
                _ = shutdown.changed() => {
                    info!("switch server stopped");
                    return Ok(());
                }
                received = self.shared.socket.recv_from(&mut buf) => match received {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error in switch server: {}", e);
                        return Err(e);
                    }
                }
            };

            trace!("received {} bytes from {:?}", num_read, from);
            self.shared.on_datagram(from, &buf[..num_read]).await;
        }
    }

    /// Stops the receive loop and withdraws all pending offers. Established channels are not
    ///  affected.
    pub fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }

        info!("stopping switch server");
        self.shared.lock_sessions().retain(|peer_addr, session| match session {
            Session::Offering { transmitter, .. } => {
                debug!("withdrawing offer to {:?}", peer_addr);
                transmitter.close();
                false
            }
            Session::Established(_) => true,
        });
    }
}
