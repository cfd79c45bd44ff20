//! A reliable channel to a single remote peer over a datagram socket.

pub mod frame;
pub mod message_handler;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::frame::{FrameFlags, FrameHeader};
use crate::channel::message_handler::{MessageHandler, ReceivedMessage};
use crate::config::ChannelConfig;
use crate::retry::RetryTransmitter;
use crate::socket::DatagramSocket;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Acknowledged,
    TimedOut,
    /// The channel was stopped before the send was resolved
    Cancelled,
}

struct PendingSend {
    /// distinguishes an entry from a later one that reuses the same id
    generation: u64,
    on_ack: Callback,
    on_fail: Callback,
    transmitter: RetryTransmitter,
}

struct ChannelShared {
    socket: Arc<dyn DatagramSocket>,
    remote_addr: SocketAddr,
    config: ChannelConfig,
    handler: Arc<dyn MessageHandler>,
    pending: Mutex<FxHashMap<u16, PendingSend>>,
    send_generation: AtomicU64,
    /// the receive loop's outcome, `None` while it is (or may still be) running
    terminated: watch::Sender<Option<Result<(), Arc<anyhow::Error>>>>,
}

impl ChannelShared {
    fn lock_pending(&self) -> MutexGuard<'_, FxHashMap<u16, PendingSend>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes all pending sends and closes their transmitters, dropping the callbacks unfired
    fn cancel_pending(&self) {
        let pending = std::mem::take(&mut *self.lock_pending());
        for (_, p) in pending {
            p.transmitter.close();
        }
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        if from != self.remote_addr {
            trace!("datagram from {:?} is not from the channel's peer {:?}", from, self.remote_addr);
            let handler = self.handler.clone();
            tokio::spawn(async move { handler.on_stray_datagram(from, datagram).await });
            return;
        }

        let header = match FrameHeader::deser(&mut datagram.as_ref()) {
            Ok(header) => header,
            Err(_) => {
                debug!("received datagram of {} bytes from {:?}, too short for a frame - dropping", datagram.len(), from);
                return;
            }
        };
        trace!("received {:?} from {:?}", header, from);

        if header.flags.contains(FrameFlags::ACK_RESPONSE) {
            self.on_ack_response(header.id);
            return;
        }

        if header.flags.contains(FrameFlags::ACK_REQUEST) {
            //NB: this replies to every copy of a frame, there is no deduplication of deliveries
            let ack = FrameHeader::ack_response(header.id).frame(&[]);
            if let Err(e) = self.socket.send_to(&ack, from).await {
                warn!("error sending ack for {} to {:?}: {}", header.id, from, e);
            }
        }

        let msg = ReceivedMessage {
            from,
            flags: header.flags,
            id: header.id,
            datagram,
        };
        let handler = self.handler.clone();
        tokio::spawn(async move { handler.on_message(msg).await });
    }

    fn on_ack_response(&self, id: u16) {
        let pending = self.lock_pending().remove(&id);
        match pending {
            Some(pending) => {
                debug!("send {} to {:?} was acknowledged", id, self.remote_addr);
                pending.transmitter.close();
                tokio::spawn(async move { (pending.on_ack)() });
            }
            None => {
                trace!("ack for {} does not match a pending send - ignoring", id);
            }
        }
    }

    fn on_send_timeout(&self, id: u16, generation: u64) {
        let pending = {
            let mut pending = self.lock_pending();
            match pending.get(&id) {
                Some(p) if p.generation == generation => pending.remove(&id),
                _ => None,
            }
        };

        if let Some(pending) = pending {
            debug!("send {} to {:?} was not acknowledged", id, self.remote_addr);
            (pending.on_fail)();
        }
    }
}

/// A reliable, selectively acknowledged channel to a single remote peer.
///
/// Every send through [Channel::send_retries] is re-transmitted until the peer acknowledges it
///  or the retry budget runs out, and exactly one of its callbacks fires. Inbound frames that
///  request an acknowledgement are acknowledged on arrival, and all inbound frames except
///  acknowledgements are passed to the [MessageHandler].
///
/// A channel is created without listening, see [Channel::start]. It stops listening when it is
///  stopped or dropped.
pub struct Channel {
    shared: Arc<ChannelShared>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel{{{:?}->{:?}}}", self.local_addr().ok(), self.shared.remote_addr)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(recv_task) = self.lock_recv_task().take() {
            recv_task.abort();
        }
        self.shared.cancel_pending();
    }
}

impl Channel {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        remote_addr: SocketAddr,
        config: ChannelConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> anyhow::Result<Channel> {
        config.validate()?;

        let (shutdown, _) = watch::channel(false);
        let (terminated, _) = watch::channel(None);
        Ok(Channel {
            shared: Arc::new(ChannelShared {
                socket,
                remote_addr,
                config,
                handler,
                pending: Default::default(),
                send_generation: AtomicU64::new(0),
                terminated,
            }),
            started: AtomicBool::new(false),
            shutdown,
            recv_task: Mutex::new(None),
        })
    }

    fn lock_recv_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.recv_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the receive loop. Starting an already started (or stopped) channel has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if *self.shutdown.borrow() {
            debug!("channel to {:?} was stopped before it was started", self.shared.remote_addr);
            self.shared.terminated.send_replace(Some(Ok(())));
            return;
        }

        let shared = self.shared.clone();
        let shutdown = self.shutdown.subscribe();
        let recv_task = tokio::spawn(async move {
            let result = Self::recv_loop(shared.clone(), shutdown).await;
            shared.terminated.send_replace(Some(result.map_err(Arc::new)));
        });
        *self.lock_recv_task() = Some(recv_task);
    }

    async fn recv_loop(shared: Arc<ChannelShared>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!("starting receive loop for channel to {:?}", shared.remote_addr);

        let mut buf = vec![0u8; shared.config.max_datagram_size];
        loop {
            let (num_read, from) = select! {
                _ = shutdown.changed() => {
                    debug!("channel to {:?} stopped", shared.remote_addr);
                    return Ok(());
                }
                received = shared.socket.recv_from(&mut buf) => match received {
                    Ok(x) => x,
                    Err(e) => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                        error!("socket error in channel to {:?}: {}", shared.remote_addr, e);
                        return Err(e);
                    }
                }
            };

            shared.on_datagram(from, Bytes::copy_from_slice(&buf[..num_read])).await;
        }
    }

    /// Stops the receive loop and all pending re-transmissions. Pending sends are discarded
    ///  without invoking their callbacks. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("stopping channel to {:?}", self.shared.remote_addr);

        self.shared.cancel_pending();
    }

    /// Waits for the receive loop to terminate, returning the error if it terminated because
    ///  of a transport failure. Returns immediately if the channel was never started. Any number
    ///  of callers may wait concurrently, and waiting does not affect [Channel::is_running].
    pub async fn closed(&self) -> anyhow::Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut terminated = self.shared.terminated.subscribe();
        let outcome = terminated.wait_for(Option::is_some).await?.clone();
        match outcome {
            Some(Err(e)) => bail!("receive loop for channel to {:?} failed: {}", self.shared.remote_addr, e),
            _ => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
            && !*self.shutdown.borrow()
            && self.shared.terminated.borrow().is_none()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Sends a payload reliably, i.e. re-sending it until the peer acknowledges it or the retry
    ///  budget runs out. Exactly one of the two callbacks is invoked, unless the channel is
    ///  stopped first.
    ///
    /// `id` must be unique among this channel's pending sends. Reusing a pending id replaces the
    ///  earlier send, whose callbacks never fire.
    pub fn send_retries(
        &self,
        id: u16,
        payload: &[u8],
        on_ack: impl FnOnce() + Send + 'static,
        on_fail: impl FnOnce() + Send + 'static,
    ) -> anyhow::Result<()> {
        let datagram = FrameHeader::ack_request(id).frame(payload);
        if datagram.len() > self.shared.config.max_datagram_size {
            bail!("payload of {} bytes exceeds the maximum datagram size {}", payload.len(), self.shared.config.max_datagram_size);
        }

        let generation = self.shared.send_generation.fetch_add(1, Ordering::AcqRel);
        let weak_shared: Weak<ChannelShared> = Arc::downgrade(&self.shared);

        // the entry is inserted while the lock is held, so a timeout can never precede it
        let mut pending = self.shared.lock_pending();

        // stop() sets the flag before it drains the map under this lock
        if *self.shutdown.borrow() {
            bail!("channel to {:?} is stopped", self.shared.remote_addr);
        }

        let transmitter = RetryTransmitter::spawn(
            self.shared.socket.clone(),
            self.shared.remote_addr,
            datagram,
            self.shared.config.retry_policy,
            move || {
                if let Some(shared) = weak_shared.upgrade() {
                    shared.on_send_timeout(id, generation);
                }
            },
        );

        let previous = pending.insert(id, PendingSend {
            generation,
            on_ack: Box::new(on_ack),
            on_fail: Box::new(on_fail),
            transmitter,
        });
        if let Some(previous) = previous {
            warn!("send {} to {:?} replaces a pending send with the same id", id, self.shared.remote_addr);
            previous.transmitter.close();
        }
        Ok(())
    }

    /// Convenience wrapper around [Channel::send_retries] that waits for the outcome
    pub async fn send_reliable(&self, id: u16, payload: &[u8]) -> anyhow::Result<SendOutcome> {
        let (outcome_sender, outcome_receiver) = oneshot::channel();

        // both callbacks share the sender, at most one of them is ever called
        let ack_slot = Arc::new(Mutex::new(Some(outcome_sender)));
        let fail_slot = ack_slot.clone();

        self.send_retries(
            id,
            payload,
            move || Self::complete(&ack_slot, SendOutcome::Acknowledged),
            move || Self::complete(&fail_slot, SendOutcome::TimedOut),
        )?;

        // the sender is dropped without a value if the channel is stopped
        Ok(outcome_receiver.await.unwrap_or(SendOutcome::Cancelled))
    }

    fn complete(slot: &Mutex<Option<oneshot::Sender<SendOutcome>>>, outcome: SendOutcome) {
        if let Some(sender) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = sender.send(outcome);
        }
    }

    /// Sends a raw datagram without frame header, acknowledgement or re-transmission
    pub async fn send_datagram(&self, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("sending unframed datagram of {} bytes to {:?}", datagram.len(), self.shared.remote_addr);
        self.shared.socket.send_to(datagram, self.shared.remote_addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::socket::MockDatagramSocket;
    use crate::test_util::FakeSocket;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::sleep;

    fn local() -> SocketAddr {
        SocketAddr::from(([10,0,0,1], 4000))
    }

    fn remote() -> SocketAddr {
        SocketAddr::from(([10,0,0,2], 5000))
    }

    fn config() -> ChannelConfig {
        ChannelConfig {
            retry_policy: RetryPolicy { retry_wait: Duration::from_millis(10), max_retries: 3 },
            max_datagram_size: 1024,
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        messages: Mutex<Vec<ReceivedMessage>>,
        strays: Mutex<Vec<(SocketAddr, Bytes)>>,
    }
    impl RecordingHandler {
        fn messages(&self) -> Vec<ReceivedMessage> {
            self.messages.lock().unwrap().clone()
        }
        fn strays(&self) -> Vec<(SocketAddr, Bytes)> {
            self.strays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn on_message(&self, msg: ReceivedMessage) {
            self.messages.lock().unwrap().push(msg);
        }
        async fn on_stray_datagram(&self, from: SocketAddr, datagram: Bytes) {
            self.strays.lock().unwrap().push((from, datagram));
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || { counter.fetch_add(1, Ordering::AcqRel); }
    }

    fn started_channel(socket: &Arc<FakeSocket>, handler: &Arc<RecordingHandler>) -> Arc<Channel> {
        let channel = Channel::new(socket.clone(), remote(), config(), handler.clone()).unwrap();
        channel.start();
        Arc::new(channel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resolves_pending_send() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        let acks = Arc::new(AtomicUsize::new(0));
        let fails = Arc::new(AtomicUsize::new(0));
        channel.send_retries(7, b"hello", counting(&acks), counting(&fails)).unwrap();
        assert_eq!(channel.pending_count(), 1);

        sleep(Duration::from_millis(1)).await;
        assert_eq!(socket.sent(), vec![(Bytes::from_static(&[1, 7, 0, b'h', b'e', b'l', b'l', b'o']), remote())]);

        socket.inject(&[2, 7, 0], remote());
        sleep(Duration::from_millis(1)).await;
        assert_eq!(acks.load(Ordering::Acquire), 1);
        assert_eq!(fails.load(Ordering::Acquire), 0);
        assert_eq!(channel.pending_count(), 0);

        // a duplicate ack is ignored
        socket.inject(&[2, 7, 0], remote());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(acks.load(Ordering::Acquire), 1);
        assert_eq!(fails.load(Ordering::Acquire), 0);

        // no re-sends after the ack, and acks are not passed to the handler
        assert_eq!(socket.sent().len(), 1);
        assert!(handler.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_invokes_fail_callback() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        let acks = Arc::new(AtomicUsize::new(0));
        let fails = Arc::new(AtomicUsize::new(0));
        channel.send_retries(3, b"x", counting(&acks), counting(&fails)).unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(socket.sent_count(&[1, 3, 0, b'x']), 4);
        assert_eq!(acks.load(Ordering::Acquire), 0);
        assert_eq!(fails.load(Ordering::Acquire), 1);
        assert_eq!(channel.pending_count(), 0);

        // a late ack has no effect
        socket.inject(&[2, 3, 0], remote());
        sleep(Duration::from_millis(1)).await;
        assert_eq!(acks.load(Ordering::Acquire), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_request_is_acknowledged_and_delivered() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let _channel = started_channel(&socket, &handler);

        socket.inject(&[1, 9, 0, 42], remote());
        sleep(Duration::from_millis(1)).await;

        assert_eq!(socket.sent(), vec![(Bytes::from_static(&[2, 9, 0]), remote())]);
        let messages = handler.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from, remote());
        assert_eq!(messages[0].flags, FrameFlags::ACK_REQUEST);
        assert_eq!(messages[0].id, 9);
        assert_eq!(messages[0].datagram.as_ref(), &[1, 9, 0, 42]);
        assert_eq!(messages[0].payload().as_ref(), &[42]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ack_request_is_delivered_twice() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let _channel = started_channel(&socket, &handler);

        socket.inject(&[1, 9, 0, 42], remote());
        socket.inject(&[1, 9, 0, 42], remote());
        sleep(Duration::from_millis(1)).await;

        assert_eq!(socket.sent_count(&[2, 9, 0]), 2);
        assert_eq!(handler.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_frame_is_delivered_without_reply() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let _channel = started_channel(&socket, &handler);

        socket.inject(&[4, 1, 0, 1, 2, 3], remote());
        sleep(Duration::from_millis(1)).await;

        assert!(socket.sent().is_empty());
        let messages = handler.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].flags, FrameFlags::MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_datagram_is_dropped() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        socket.inject(&[1, 9], remote());
        socket.inject(&[], remote());
        sleep(Duration::from_millis(1)).await;
        assert!(socket.sent().is_empty());
        assert!(handler.messages().is_empty());
        assert!(channel.is_running());

        // the receive loop is still alive
        socket.inject(&[1, 9, 0], remote());
        sleep(Duration::from_millis(1)).await;
        assert_eq!(handler.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_datagram_gets_no_frame_processing() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        let acks = Arc::new(AtomicUsize::new(0));
        let fails = Arc::new(AtomicUsize::new(0));
        channel.send_retries(7, b"", counting(&acks), counting(&fails)).unwrap();
        sleep(Duration::from_millis(1)).await;

        let stranger = SocketAddr::from(([10,0,0,3], 6000));
        socket.inject(&[1, 9, 0], stranger);
        socket.inject(&[2, 7, 0], stranger);
        sleep(Duration::from_millis(1)).await;

        assert_eq!(socket.sent_count(&[2, 9, 0]), 0);
        assert_eq!(acks.load(Ordering::Acquire), 0);
        assert_eq!(channel.pending_count(), 1);
        assert!(handler.messages().is_empty());
        let strays = handler.strays();
        assert_eq!(strays.len(), 2);
        assert!(strays.contains(&(stranger, Bytes::from_static(&[1, 9, 0]))));
        assert!(strays.contains(&(stranger, Bytes::from_static(&[2, 7, 0]))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_id_replaces_pending_send() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        channel.send_retries(1, b"a", counting(&first), counting(&first)).unwrap();
        channel.send_retries(1, b"b", counting(&second), counting(&second)).unwrap();
        assert_eq!(channel.pending_count(), 1);

        sleep(Duration::from_millis(1)).await;
        socket.inject(&[2, 1, 0], remote());
        sleep(Duration::from_millis(100)).await;

        assert_eq!(first.load(Ordering::Acquire), 0);
        assert_eq!(second.load(Ordering::Acquire), 1);
        assert_eq!(socket.sent_count(&[1, 1, 0, b'b']), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reliable() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        let c = channel.clone();
        let acked = tokio::spawn(async move { c.send_reliable(5, b"p").await });
        sleep(Duration::from_millis(1)).await;
        socket.inject(&[2, 5, 0], remote());
        assert_eq!(acked.await.unwrap().unwrap(), SendOutcome::Acknowledged);

        assert_eq!(channel.send_reliable(6, b"q").await.unwrap(), SendOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_sends() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        let c = channel.clone();
        let outcome = tokio::spawn(async move { c.send_reliable(5, b"p").await });
        sleep(Duration::from_millis(1)).await;
        assert!(channel.is_running());

        channel.stop();
        channel.stop();
        assert_eq!(outcome.await.unwrap().unwrap(), SendOutcome::Cancelled);
        assert!(channel.closed().await.is_ok());
        assert!(!channel.is_running());
        assert_eq!(channel.pending_count(), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(socket.sent().len(), 1);
        assert!(channel.send_retries(6, b"", || {}, || {}).is_err());

        // inbound traffic is no longer processed
        socket.inject(&[1, 9, 0], remote());
        sleep(Duration::from_millis(1)).await;
        assert!(handler.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_close_keeps_channel_running() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        let c = channel.clone();
        let first_waiter = tokio::spawn(async move { c.closed().await });
        let c = channel.clone();
        let second_waiter = tokio::spawn(async move { c.closed().await });
        sleep(Duration::from_millis(1)).await;
        assert!(channel.is_running());

        socket.inject(&[1, 9, 0], remote());
        sleep(Duration::from_millis(1)).await;
        assert!(channel.is_running());
        assert_eq!(socket.sent_count(&[2, 9, 0]), 1);
        assert_eq!(handler.messages().len(), 1);
        assert!(!first_waiter.is_finished());

        channel.stop();
        assert!(first_waiter.await.unwrap().is_ok());
        assert!(second_waiter.await.unwrap().is_ok());
        assert!(!channel.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_retransmissions() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let config = ChannelConfig {
            retry_policy: RetryPolicy { retry_wait: Duration::from_millis(10), max_retries: 5 },
            ..config()
        };
        let channel = Channel::new(socket.clone(), remote(), config, handler).unwrap();
        channel.start();

        let acks = Arc::new(AtomicUsize::new(0));
        let fails = Arc::new(AtomicUsize::new(0));
        channel.send_retries(3, b"x", counting(&acks), counting(&fails)).unwrap();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(socket.sent_count(&[1, 3, 0, b'x']), 1);

        drop(channel);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(socket.sent_count(&[1, 3, 0, b'x']), 1);
        assert_eq!(acks.load(Ordering::Acquire), 0);
        assert_eq!(fails.load(Ordering::Acquire), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_send_racing_stop_leaves_nothing_pending() {
        let socket = Arc::new(FakeSocket::new(local()));

        for _ in 0..200 {
            let channel = Arc::new(Channel::new(socket.clone(), remote(), config(), Arc::new(RecordingHandler::default())).unwrap());

            let c = channel.clone();
            let send = tokio::spawn(async move { c.send_retries(1, b"x", || {}, || {}).is_ok() });
            let c = channel.clone();
            let stop = tokio::spawn(async move { c.stop() });
            let (sent, stopped) = tokio::join!(send, stop);
            stopped.unwrap();
            let _ = sent.unwrap();

            assert_eq!(channel.pending_count(), 0);
            assert!(channel.send_retries(2, b"x", || {}, || {}).is_err());
        }
    }

    #[rstest]
    #[case::before_timeout(39)]
    #[case::at_timeout(40)]
    #[case::after_timeout(41)]
    fn test_ack_racing_timeout_has_single_outcome(#[case] ack_after_millis: u64) {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let socket = Arc::new(FakeSocket::new(local()));
            let handler = Arc::new(RecordingHandler::default());
            let channel = started_channel(&socket, &handler);

            // sends at 0, 10, 20, 30 and timeout at 40
            let acks = Arc::new(AtomicUsize::new(0));
            let fails = Arc::new(AtomicUsize::new(0));
            channel.send_retries(3, b"x", counting(&acks), counting(&fails)).unwrap();

            sleep(Duration::from_millis(ack_after_millis)).await;
            socket.inject(&[2, 3, 0], remote());

            sleep(Duration::from_millis(100)).await;
            assert_eq!(acks.load(Ordering::Acquire) + fails.load(Ordering::Acquire), 1);
            assert_eq!(channel.pending_count(), 0);
            assert_eq!(socket.sent_count(&[1, 3, 0, b'x']), 4);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_of_replaced_send_is_ignored() {
        let socket = Arc::new(FakeSocket::new(local()));
        let handler = Arc::new(RecordingHandler::default());
        let channel = started_channel(&socket, &handler);

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        channel.send_retries(1, b"a", counting(&first), counting(&first)).unwrap();
        let first_generation = channel.shared.lock_pending()[&1].generation;
        channel.send_retries(1, b"b", counting(&second), counting(&second)).unwrap();
        sleep(Duration::from_millis(1)).await;

        // the first transmitter's timeout arrives after its entry was replaced
        channel.shared.on_send_timeout(1, first_generation);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(channel.pending_count(), 1);
        assert_eq!(first.load(Ordering::Acquire), 0);
        assert_eq!(second.load(Ordering::Acquire), 0);

        socket.inject(&[2, 1, 0], remote());
        sleep(Duration::from_millis(1)).await;
        assert_eq!(second.load(Ordering::Acquire), 1);
        assert_eq!(first.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_stopped_channel_does_not_start() {
        let socket = Arc::new(FakeSocket::new(local()));
        let channel = Channel::new(socket, remote(), config(), Arc::new(RecordingHandler::default())).unwrap();
        assert!(!channel.is_running());

        channel.stop();
        channel.start();
        assert!(!channel.is_running());
        assert!(channel.closed().await.is_ok());
    }

    #[tokio::test]
    async fn test_socket_error_terminates_channel() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_recv_from()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("socket failure")));

        let channel = Channel::new(Arc::new(socket), remote(), config(), Arc::new(RecordingHandler::default())).unwrap();
        channel.start();
        assert!(channel.closed().await.is_err());
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let socket = Arc::new(FakeSocket::new(local()));
        let config = ChannelConfig {
            max_datagram_size: 10,
            ..config()
        };
        let channel = Channel::new(socket.clone(), remote(), config, Arc::new(RecordingHandler::default())).unwrap();

        assert!(channel.send_retries(1, &[0; 8], || {}, || {}).is_err());
        assert!(channel.send_retries(1, &[0; 7], || {}, || {}).is_ok());
        channel.stop();
    }

    #[tokio::test]
    async fn test_send_datagram_is_unframed() {
        let socket = Arc::new(FakeSocket::new(local()));
        let channel = Channel::new(socket.clone(), remote(), config(), Arc::new(RecordingHandler::default())).unwrap();

        channel.send_datagram(b"raw").await.unwrap();
        assert_eq!(socket.sent(), vec![(Bytes::from_static(b"raw"), remote())]);
        assert_eq!(channel.local_addr().unwrap(), local());
        assert_eq!(channel.remote_addr(), remote());
    }
}
