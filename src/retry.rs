use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::config::RetryPolicy;
use crate::socket::DatagramSocket;

struct RetryTransmitterInner {
    peer_addr: SocketAddr,
    retry_count: AtomicU32,
    running: AtomicBool,
    closed: Notify,
}

/// Re-sends a single fixed datagram at a fixed interval until it is closed or the retry budget is
///  exhausted. The two outcomes are mutually exclusive: once closed, the timeout callback never
///  fires, and after the timeout callback fired, closing is a no-op.
///
/// This is a cheap handle - clones refer to the same transmission.
#[derive(Clone)]
pub struct RetryTransmitter {
    inner: Arc<RetryTransmitterInner>,
}

impl Debug for RetryTransmitter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RetryTransmitter{{peer:{:?}, retry_count:{}, running:{}}}", self.inner.peer_addr, self.retry_count(), self.is_running())
    }
}

impl RetryTransmitter {
    /// Starts sending in the background. The first send happens as soon as the spawned task is
    ///  scheduled, without waiting for the retry interval.
    pub fn spawn(
        socket: Arc<dyn DatagramSocket>,
        peer_addr: SocketAddr,
        datagram: Bytes,
        policy: RetryPolicy,
        on_timeout: impl FnOnce() + Send + 'static,
    ) -> RetryTransmitter {
        let inner = Arc::new(RetryTransmitterInner {
            peer_addr,
            retry_count: AtomicU32::new(0),
            running: AtomicBool::new(true),
            closed: Notify::new(),
        });

        tokio::spawn(Self::do_loop(socket, datagram, policy, inner.clone(), on_timeout));

        RetryTransmitter { inner }
    }

    async fn do_loop(
        socket: Arc<dyn DatagramSocket>,
        datagram: Bytes,
        policy: RetryPolicy,
        inner: Arc<RetryTransmitterInner>,
        on_timeout: impl FnOnce() + Send + 'static,
    ) {
        loop {
            if !inner.running.load(Ordering::Acquire) {
                trace!("retry transmitter for {:?} closed", inner.peer_addr);
                return;
            }
            if inner.retry_count.load(Ordering::Acquire) > policy.max_retries {
                break;
            }

            trace!("sending datagram to {:?}, attempt {}", inner.peer_addr, inner.retry_count.load(Ordering::Acquire));
            if let Err(e) = socket.send_to(&datagram, inner.peer_addr).await {
                //NB: a failed send counts as an attempt, the retry loop takes care of recovery
                warn!("error sending datagram to {:?}: {}", inner.peer_addr, e);
            }
            inner.retry_count.fetch_add(1, Ordering::AcqRel);

            select! {
                _ = sleep(policy.retry_wait) => {}
                _ = inner.closed.notified() => {}
            }
        }

        // whoever flips the flag first decides the outcome: either close() or the timeout
        if inner.running.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            debug!("no confirmation from {:?} after {} sends - giving up", inner.peer_addr, policy.max_retries + 1);
            on_timeout();
        }
    }

    /// Stops re-sending immediately, waking up a pending wait. Idempotent.
    ///
    /// Returns `true` if this call stopped the transmitter, and `false` if it was closed before or
    ///  timed out.
    pub fn close(&self) -> bool {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            trace!("closing retry transmitter for {:?}", self.inner.peer_addr);
            self.inner.closed.notify_one();
            true
        }
        else {
            false
        }
    }

    /// Restarts the retry budget without affecting whether the transmitter is running
    pub fn reset_retry_count(&self) {
        self.inner.retry_count.store(0, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }
}
