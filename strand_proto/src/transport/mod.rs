//! Client and Server Transports
//!
//! Transports own sockets and I/O thread groups. They adopt native sockets as
//! [`Connection`]s, run one task per connection on their worker group, and
//! report everything that happens through a [`ConnectionHandler`].
//!
//! # Features
//!
//! - TCP and UDP variants of both sides
//! - Private or shared (reference counted) worker groups
//! - Cancellable connects bounded by `conn_timeout`
//! - Keep-alive pooling of one connection per remote address
//! - Multi-bind listeners when port reuse is available
//!
//! # Important Notes
//!
//! - `open` must be called before any other operation
//! - `close` resolves once every connection task has terminated; the worker
//!   group is released afterwards
//!
//! # Related Components
//!
//! - `strand_io::io_group`: thread groups and the shared group manager
//! - `strand_wire::socket_helpers`: socket construction
//! - `proto::adapter`: codec integration

use crate::error::RpcError;
use crate::proto::connection::Connection;
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use strand_io::tokio::runtime::Handle;
use strand_io::tokio::sync::oneshot;
use strand_io::tokio::time::Instant;
use strand_io::{IoGroup, Mutex, SharedIoGroupManager};
use strand_types::config::ProtocolConfig;
use strand_wire::SocketOptions;

pub(crate) mod tcp_io;
pub(crate) mod udp_io;

pub mod tcp_client;
pub mod tcp_server;
pub mod udp_client;
pub mod udp_server;

pub use tcp_client::TcpClientTransport;
pub use tcp_server::TcpServerTransport;
pub use udp_client::UdpClientTransport;
pub use udp_server::UdpServerTransport;

#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    fn config(&self) -> &ProtocolConfig;

    /// Joins (or creates) the worker group. Idempotent
    fn open(&self) -> Result<(), RpcError>;

    /// Starts connecting to `addr`. Dropping the returned future before it
    /// resolves abandons the attempt
    fn connect(&self, addr: SocketAddr) -> ConnectFuture;

    /// Returns the pooled connection to `addr` when keep-alive is enabled and
    /// one is live, otherwise connects
    async fn get_or_connect(&self, addr: SocketAddr) -> Result<Connection, RpcError>;

    fn connections(&self) -> Vec<Connection>;

    /// The runtime handle of the worker group
    fn io_handle(&self) -> Result<Handle, RpcError>;

    async fn close(&self);
}

#[async_trait]
pub trait ServerTransport: Send + Sync + 'static {
    /// Binds and starts accepting. Returns the bound address, which differs
    /// from the configured one when port 0 was requested
    fn open(&self) -> Result<SocketAddr, RpcError>;

    fn channels(&self) -> Vec<Connection>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// How many sockets `open` bound: `boss_threads` with port reuse, else one
    fn bound_sockets(&self) -> usize;

    async fn close(&self);
}

/// Which side of a conversation a connection task serves
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// Resolves to the new connection, or to the reason it could not be made.
///
/// Dropping it before the socket is active abandons the attempt; dropping it
/// once a new connection was handed over but not yet claimed closes that
/// connection
pub struct ConnectFuture {
    rx: oneshot::Receiver<Result<Connection, RpcError>>,
    close_unclaimed: bool,
}

impl ConnectFuture {
    pub(crate) fn channel() -> (oneshot::Sender<Result<Connection, RpcError>>, Self) {
        let (tx, rx) = oneshot::channel();
        let future = Self {
            rx,
            close_unclaimed: true,
        };
        (tx, future)
    }

    /// Already resolved. `result` may be a connection other callers share,
    /// so an unclaimed one is left open
    pub(crate) fn ready(result: Result<Connection, RpcError>) -> Self {
        let (tx, mut future) = Self::channel();
        future.close_unclaimed = false;
        let _ = tx.send(result);
        future
    }
}

impl Future for ConnectFuture {
    type Output = Result<Connection, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ConnectFuture {
    fn drop(&mut self) {
        self.rx.close();
        if !self.close_unclaimed {
            return;
        }

        if let Ok(Ok(connection)) = self.rx.try_recv() {
            log::trace!(target: "strand", "Connect future dropped unclaimed; closing {connection:?}");
            connection.shutdown();
        }
    }
}

/// The worker group a transport runs on, joined on `open` and released on
/// `close`
pub(crate) struct GroupSlot {
    name: &'static str,
    share: bool,
    threads: usize,
    manager: SharedIoGroupManager,
    group: Mutex<Option<IoGroup>>,
}

impl GroupSlot {
    pub fn new(
        name: &'static str,
        share: bool,
        threads: usize,
        manager: SharedIoGroupManager,
    ) -> Self {
        Self {
            name,
            share,
            threads,
            manager,
            group: Mutex::new(None),
        }
    }

    pub fn from_config(
        name: &'static str,
        config: &ProtocolConfig,
        manager: SharedIoGroupManager,
    ) -> Self {
        Self::new(name, config.io_thread_group_share, config.io_threads, manager)
    }

    pub fn open(&self) -> Result<Handle, RpcError> {
        let mut group = self.group.lock();
        if let Some(group) = group.as_ref() {
            return Ok(group.handle().clone());
        }

        let joined = IoGroup::resolve(self.share, &self.manager, self.name, self.threads)?;
        log::trace!(target: "strand", "Joined I/O group {joined:?}");
        let handle = joined.handle().clone();
        *group = Some(joined);
        Ok(handle)
    }

    pub fn handle(&self) -> Result<Handle, RpcError> {
        self.group
            .lock()
            .as_ref()
            .map(|group| group.handle().clone())
            .ok_or_else(|| RpcError::msg("transport is not open"))
    }

    pub fn release(&self) {
        let released = self.group.lock().take();
        if let Some(group) = released {
            log::trace!(target: "strand", "Releasing I/O group {group:?}");
            drop(group);
        }
    }
}

pub(crate) fn socket_options(config: &ProtocolConfig) -> SocketOptions {
    SocketOptions {
        reuse_port: config.reuse_port,
        backlog: config.backlog,
        receive_buffer: config.receive_buffer,
        send_buffer: config.send_buffer,
    }
}

/// How many sockets a server binds: one per acceptor when port reuse is both
/// requested and available, otherwise one
pub(crate) fn bind_count(config: &ProtocolConfig) -> usize {
    if config.reuse_port && strand_wire::socket_helpers::is_reuse_port_supported() {
        config.boss_threads.max(1)
    } else {
        1
    }
}

/// Resolves at `deadline`, or never when idle expiry is disabled
pub(crate) async fn idle_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => strand_io::tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
