//! UDP Endpoint
//!
//! One bound datagram socket and the peers it talks to. A receive loop routes
//! every datagram to the task of the peer that sent it; each peer task decodes
//! its own datagrams and writes its own replies, so handler upcalls for one
//! peer never overlap, just like a TCP connection.
//!
//! # Important Notes
//!
//! - Servers adopt unknown senders as new peers; clients only accept
//!   datagrams from peers they connected to
//! - A datagram that fails to decode is dropped and reported as a fault; the
//!   peer stays connected
//! - Peers expire after `idle_timeout` like TCP connections: server peers on
//!   inbound silence, client peers on silence in both directions. A sender
//!   that writes again after expiry becomes a new peer

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::RpcError;
use crate::proto::adapter::DatagramCodecAdapter;
use crate::proto::connection::{Connection, ConnectionId, Outbound, OutboundReceiver};
use crate::proto::handler::ConnectionHandler;
use crate::proto::registry::ConnectionRegistry;
use crate::transport::{idle_until, Side};
use bytes::Bytes;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use strand_io::tokio::net::UdpSocket;
use strand_io::tokio::runtime::Handle;
use strand_io::tokio::sync::mpsc;
use strand_io::tokio::time::Instant;
use strand_io::tokio_util::sync::CancellationToken;
use strand_io::Mutex;
use strand_types::config::{Network, ProtocolConfig};

/// When a peer counts as idle
#[derive(Copy, Clone, Debug)]
pub(crate) struct PeerIdle {
    timeout: Option<Duration>,
    outbound_is_activity: bool,
}

impl PeerIdle {
    pub fn new(config: &ProtocolConfig, side: Side) -> Self {
        Self {
            timeout: config.idle_timeout_duration(),
            outbound_is_activity: side == Side::Client,
        }
    }
}

pub(crate) struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    adapter: Arc<DatagramCodecAdapter>,
    handler: Arc<dyn ConnectionHandler>,
    peers: ConnectionRegistry<SocketAddr>,
    inboxes: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Bytes>>>,
    shutdown: CancellationToken,
    handle: Handle,
    idle: PeerIdle,
}

impl UdpEndpoint {
    pub fn new(
        socket: UdpSocket,
        adapter: Arc<DatagramCodecAdapter>,
        handler: Arc<dyn ConnectionHandler>,
        shutdown: CancellationToken,
        handle: Handle,
        idle: PeerIdle,
    ) -> Result<Arc<Self>, RpcError> {
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(Self {
            socket,
            local_addr,
            adapter,
            handler,
            peers: ConnectionRegistry::new(),
            inboxes: Mutex::new(HashMap::new()),
            shutdown,
            handle,
            idle,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &ConnectionRegistry<SocketAddr> {
        &self.peers
    }

    /// Returns the live peer connection for `addr`, creating it if needed
    pub fn peer(self: &Arc<Self>, addr: SocketAddr) -> Connection {
        let mut parts = None;
        let created = self.peers.get_or_insert_with::<Infallible>(addr, || {
            let (connection, outbound) = Connection::new(
                Network::Udp,
                self.local_addr,
                Some(addr),
                self.shutdown.child_token(),
            );
            let (inbox, inbound) = mpsc::unbounded_channel();
            let _ = self.inboxes.lock().insert(connection.id(), inbox);
            parts = Some((outbound, inbound));
            Ok(connection)
        });

        let connection = match created {
            Ok((connection, _)) => connection,
            Err(never) => match never {},
        };

        if let Some((outbound, inbound)) = parts {
            log::debug!(target: "strand", "Tracking UDP peer {connection:?}");
            let task = self.clone().run_peer(connection.clone(), outbound, inbound);
            let _ = strand_io::spawn_on(&self.handle, task);
        }

        connection
    }

    /// Receives until the endpoint shuts down. With `accept_unknown` unset,
    /// datagrams from addresses without a peer connection are dropped
    pub async fn recv_loop(self: Arc<Self>, accept_unknown: bool) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            strand_io::tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, sender)) => {
                        let datagram = Bytes::copy_from_slice(&buf[..len]);
                        self.route(sender, datagram, accept_unknown);
                    }
                    Err(err) => {
                        // ICMP errors from earlier sends surface here on some platforms
                        log::debug!(target: "strand", "UDP receive error on {}: {err:?}", self.local_addr);
                    }
                },
            }
        }

        log::trace!(target: "strand", "UDP endpoint {} stopped receiving", self.local_addr);
    }

    fn route(self: &Arc<Self>, sender: SocketAddr, datagram: Bytes, accept_unknown: bool) {
        let connection = match self.peers.get(&sender).filter(Connection::is_connected) {
            Some(connection) => connection,
            None if accept_unknown => self.peer(sender),
            None => {
                log::trace!(target: "strand", "Dropping {} byte datagram from unknown peer {sender}", datagram.len());
                return;
            }
        };

        if let Some(inbox) = self.inboxes.lock().get(&connection.id()) {
            let _ = inbox.send(datagram);
        }
    }

    async fn run_peer(
        self: Arc<Self>,
        connection: Connection,
        mut outbound: OutboundReceiver,
        mut inbound: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let shutdown = connection.shutdown_token().clone();
        let mut last_activity = Instant::now();
        self.handler.connected(&connection);

        loop {
            let idle_deadline = self.idle.timeout.map(|timeout| last_activity + timeout);

            strand_io::tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(datagram) = inbound.recv() => {
                    last_activity = Instant::now();
                    self.on_datagram(&connection, datagram);
                }

                next = outbound.recv() => match next {
                    Some(next) => {
                        if self.idle.outbound_is_activity {
                            last_activity = Instant::now();
                        }
                        self.send(&connection, next).await;
                    }
                    None => break,
                },

                _ = idle_until(idle_deadline) => {
                    log::debug!(target: "strand", "Expiring idle UDP peer {connection:?} after {:?}", self.idle.timeout);
                    break;
                }
            }
        }

        connection.mark_disconnected();
        if let Some(addr) = connection.remote_addr() {
            let _ = self.peers.remove_if_current(&addr, connection.id());
        }
        let _ = self.inboxes.lock().remove(&connection.id());

        inbound.close();
        while let Ok(datagram) = inbound.try_recv() {
            self.on_datagram(&connection, datagram);
        }

        outbound.close();
        while let Ok(pending) = outbound.try_recv() {
            let _ = pending.acknowledge(Err(RpcError::ConnectionClosed));
        }

        log::trace!(target: "strand", "Closed UDP peer {connection:?}");
        self.handler.disconnected(&connection);
        connection.mark_terminated();
    }

    fn on_datagram(&self, connection: &Connection, datagram: Bytes) {
        let sender = connection.remote_addr().unwrap_or(self.local_addr);
        let mut messages = Vec::new();
        let result = self
            .adapter
            .decode(connection, sender, datagram, &mut messages);

        for message in messages {
            self.handler.received(connection, message);
        }

        if let Err(err) = result {
            log::warn!(target: "strand", "Dropping datagram from {sender}: {err:?}");
            self.handler.faulted(connection, &err);
        }
    }

    async fn send(&self, connection: &Connection, next: Outbound) {
        let (destination, bytes) = match self.adapter.encode(connection, &next.message) {
            Ok(encoded) => encoded,
            Err(err) => {
                log::warn!(target: "strand", "Dropping message {} on {connection:?}: {err:?}", next.message.request_id());
                let _ = next.acknowledge(Err(err));
                return;
            }
        };

        match self.socket.send_to(&bytes, destination).await {
            Ok(_) => {
                let message = next.acknowledge(Ok(()));
                self.handler.sent(connection, &message);
            }
            Err(err) => {
                log::warn!(target: "strand", "UDP send to {destination} failed: {err:?}");
                let _ = next.acknowledge(Err(RpcError::from(err)));
            }
        }
    }
}
