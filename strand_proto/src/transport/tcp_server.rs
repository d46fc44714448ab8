use crate::constants::{ACCEPTOR_GROUP_NAME, ACCEPT_ERROR_BACKOFF_MS, SERVER_IO_GROUP_NAME};
use crate::error::RpcError;
use crate::proto::codec::Codec;
use crate::proto::connection::{Connection, ConnectionId};
use crate::proto::handler::ConnectionHandler;
use crate::proto::registry::ConnectionRegistry;
use crate::transport::tcp_io::spawn_tcp_connection;
use crate::transport::{bind_count, socket_options, GroupSlot, ServerTransport, Side};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_io::tokio::net::TcpListener;
use strand_io::tokio::runtime::Handle;
use strand_io::tokio_util::sync::CancellationToken;
use strand_io::{IoThreadGroup, Mutex, SharedIoGroupManager};
use strand_types::config::ProtocolConfig;

/// Accepts TCP connections on one or more listeners and runs them on the
/// server worker group
pub struct TcpServerTransport {
    inner: Arc<TcpServerInner>,
    acceptors: Mutex<Option<IoThreadGroup>>,
    local_addr: Mutex<Option<SocketAddr>>,
    bound: AtomicUsize,
}

struct TcpServerInner {
    config: ProtocolConfig,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn ConnectionHandler>,
    group: GroupSlot,
    channels: Arc<ConnectionRegistry<ConnectionId>>,
    shutdown: CancellationToken,
}

impl TcpServerTransport {
    pub fn new(
        config: ProtocolConfig,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self::with_manager(config, codec, handler, SharedIoGroupManager::global().clone())
    }

    pub fn with_manager(
        config: ProtocolConfig,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
        manager: SharedIoGroupManager,
    ) -> Self {
        let group = GroupSlot::from_config(SERVER_IO_GROUP_NAME, &config, manager);
        Self {
            inner: Arc::new(TcpServerInner {
                config,
                codec,
                handler,
                group,
                channels: Arc::new(ConnectionRegistry::new()),
                shutdown: CancellationToken::new(),
            }),
            acceptors: Mutex::new(None),
            local_addr: Mutex::new(None),
            bound: AtomicUsize::new(0),
        }
    }

    fn bind_all(&self, acceptor: &Handle) -> Result<Vec<TcpListener>, RpcError> {
        let options = socket_options(&self.inner.config);
        let mut addr = self.inner.config.socket_addr();
        let mut listeners = Vec::new();
        let _guard = acceptor.enter();

        for _ in 0..bind_count(&self.inner.config) {
            let listener = strand_wire::socket_helpers::get_tcp_listener(addr, &options)
                .map_err(|err| RpcError::Bind(format!("{addr}: {err}")))?;
            // later binds share the port the first one resolved
            addr = listener.local_addr()?;
            listeners.push(listener);
        }

        Ok(listeners)
    }
}

impl TcpServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, workers: Handle) {
        loop {
            strand_io::tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::trace!(target: "strand", "Accepted TCP connection from {peer}");
                        if let Err(err) = spawn_tcp_connection(
                            &workers,
                            stream,
                            self.shutdown.child_token(),
                            self.codec.clone(),
                            &self.config,
                            Side::Server,
                            self.handler.clone(),
                            &self.channels,
                            None,
                        ) {
                            log::warn!(target: "strand", "Unable to adopt connection from {peer}: {err:?}");
                        }
                    }

                    Err(err) => {
                        // usually fd exhaustion; back off instead of spinning
                        log::warn!(target: "strand", "Accept failed: {err:?}");
                        strand_io::tokio::time::sleep(Duration::from_millis(ACCEPT_ERROR_BACKOFF_MS)).await;
                    }
                },
            }
        }

        log::trace!(target: "strand", "Acceptor on {:?} stopped", listener.local_addr());
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    fn open(&self) -> Result<SocketAddr, RpcError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::msg("transport has been closed"));
        }

        if let Some(addr) = *self.local_addr.lock() {
            return Ok(addr);
        }

        self.inner.config.validate()?;
        let workers = self.inner.group.open()?;
        let acceptor = match IoThreadGroup::new(
            ACCEPTOR_GROUP_NAME,
            self.inner.config.boss_threads.max(1),
        ) {
            Ok(acceptor) => acceptor,
            Err(err) => {
                self.inner.group.release();
                return Err(err.into());
            }
        };

        let listeners = match self.bind_all(acceptor.handle()) {
            Ok(listeners) => listeners,
            Err(err) => {
                log::error!(target: "strand", "TCP server failed to bind: {err:?}");
                drop(acceptor);
                self.inner.group.release();
                return Err(err);
            }
        };

        let local_addr = match listeners.first() {
            Some(listener) => listener.local_addr()?,
            None => return Err(RpcError::Bind("no listener was bound".to_string())),
        };
        self.bound.store(listeners.len(), Ordering::SeqCst);
        for listener in listeners {
            let task = self.inner.clone().accept_loop(listener, workers.clone());
            let _ = strand_io::spawn_on(acceptor.handle(), task);
        }

        log::info!(target: "strand", "TCP server listening on {local_addr}");
        *self.acceptors.lock() = Some(acceptor);
        *self.local_addr.lock() = Some(local_addr);
        Ok(local_addr)
    }

    fn channels(&self) -> Vec<Connection> {
        self.inner.channels.snapshot()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn bound_sockets(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
        for channel in self.inner.channels.snapshot() {
            channel.closed().await;
        }

        let acceptors = self.acceptors.lock().take();
        drop(acceptors);
        self.inner.group.release();
        log::debug!(target: "strand", "TCP server transport closed");
    }
}
