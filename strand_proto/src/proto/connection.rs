//! Connection Handle
//!
//! A [`Connection`] is the cheaply cloneable handle to one live transport
//! channel: a TCP stream, or one addressed peer of a UDP socket. The socket
//! itself is owned by exactly one I/O task; every handle only talks to that
//! task through its outbound queue and shutdown token.
//!
//! # Features
//!
//! - Immutable identity and addresses, fixed when the socket is adopted
//! - Monotonic liveness: connected to disconnected, exactly once
//! - Acknowledged sends that resolve once the bytes reach the socket
//! - Graceful close that resolves once the I/O task has terminated
//!
//! # Important Notes
//!
//! - Handles never touch the socket directly, so they can be cloned into any
//!   task or thread
//! - Messages queued on one connection are written in submission order
//!
//! # Related Components
//!
//! - `transport::tcp_io` / `transport::udp_io`: the tasks owning the sockets
//! - `proto::registry`: tracks live handles by key

use crate::error::RpcError;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use strand_io::tokio::sync::{mpsc, oneshot};
use strand_io::tokio_util::sync::CancellationToken;
use strand_types::config::Network;
use strand_types::proto::Message;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type ConnectionId = u64;

/// A message waiting for the I/O task, with an optional write acknowledgement
pub(crate) struct Outbound {
    pub message: Message,
    pub ack: Option<oneshot::Sender<Result<(), RpcError>>>,
}

impl Outbound {
    pub fn acknowledge(self, result: Result<(), RpcError>) -> Message {
        if let Some(ack) = self.ack {
            let _ = ack.send(result);
        }

        self.message
    }
}

pub(crate) type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    network: Network,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    connected: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: CancellationToken,
    terminated: CancellationToken,
}

impl Connection {
    /// Creates the handle and the queue its I/O task drains. `shutdown` is
    /// normally a child of the owning transport's token, so that closing the
    /// transport closes every connection it created
    pub(crate) fn new(
        network: Network,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> (Self, OutboundReceiver) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id,
                network,
                local_addr,
                remote_addr,
                connected: AtomicBool::new(true),
                outbound,
                shutdown,
                terminated: CancellationToken::new(),
            }),
        };

        (connection, rx)
    }

    /// A handle that is not backed by any socket. It reports itself
    /// disconnected and every send fails with [`RpcError::ConnectionClosed`].
    /// Useful wherever a codec needs a connection context outside a transport
    pub fn detached(
        network: Network,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let (connection, _) = Self::new(network, local_addr, remote_addr, CancellationToken::new());
        connection.mark_disconnected();
        connection.mark_terminated();
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn network(&self) -> Network {
        self.inner.network
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Queues `message` and resolves once it has been written to the socket
    pub async fn send<T: Into<Message>>(&self, message: T) -> Result<(), RpcError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Outbound {
            message: message.into(),
            ack: Some(tx),
        })?;
        rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Queues `message` without waiting for the write
    pub fn send_nowait<T: Into<Message>>(&self, message: T) -> Result<(), RpcError> {
        self.enqueue(Outbound {
            message: message.into(),
            ack: None,
        })
    }

    fn enqueue(&self, outbound: Outbound) -> Result<(), RpcError> {
        if !self.is_connected() {
            return Err(RpcError::ConnectionClosed);
        }

        self.inner.outbound.send(outbound).map_err(RpcError::from)
    }

    /// Asks the I/O task to close the connection without waiting for it
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel()
    }

    /// Closes the connection and resolves once its I/O task has terminated
    pub async fn close(&self) {
        self.shutdown();
        self.closed().await
    }

    /// Resolves once the I/O task has terminated
    pub async fn closed(&self) {
        self.inner.terminated.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Returns true for the single caller that observes the transition
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.inner
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_terminated(&self) {
        self.inner.terminated.cancel()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection[{}]({} {} -> {:?}, connected: {})",
            self.inner.id,
            self.inner.network,
            self.inner.local_addr,
            self.inner.remote_addr,
            self.is_connected()
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::error::RpcError;
    use crate::proto::connection::Connection;
    use std::net::SocketAddr;
    use strand_io::tokio_util::sync::CancellationToken;
    use strand_types::config::Network;
    use strand_types::proto::{Message, Response};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn liveness_transitions_once() {
        let (connection, _rx) =
            Connection::new(Network::Tcp, addr(1), Some(addr(2)), CancellationToken::new());
        assert!(connection.is_connected());
        assert!(connection.mark_disconnected());
        assert!(!connection.mark_disconnected());
        assert!(!connection.is_connected());
    }

    #[test]
    fn ids_are_unique_and_addresses_fixed() {
        let (first, _rx0) =
            Connection::new(Network::Tcp, addr(1), Some(addr(2)), CancellationToken::new());
        let (second, _rx1) = Connection::new(Network::Udp, addr(3), None, CancellationToken::new());
        assert_ne!(first.id(), second.id());
        assert_eq!(first.local_addr(), addr(1));
        assert_eq!(first.remote_addr(), Some(addr(2)));
        assert_eq!(second.remote_addr(), None);
        assert_eq!(first.clone(), first);
    }

    #[tokio::test]
    async fn send_resolves_with_task_acknowledgement() {
        let (connection, mut rx) =
            Connection::new(Network::Tcp, addr(1), Some(addr(2)), CancellationToken::new());
        let task = tokio::spawn(async move {
            let outbound = rx.recv().await.unwrap();
            let message = outbound.acknowledge(Ok(()));
            message.request_id()
        });

        connection
            .send(Message::Response(Response::new(7, Ok("pong".into()))))
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn detached_connection_rejects_sends() {
        let connection = Connection::detached(Network::Udp, addr(1), None);
        assert!(!connection.is_connected());
        let result = connection
            .send(Response::new(1, Ok(Default::default())))
            .await;
        assert_eq!(result, Err(RpcError::ConnectionClosed));
        // already terminated, so this resolves immediately
        connection.close().await;
    }
}
