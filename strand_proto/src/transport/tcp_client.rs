use crate::constants::CLIENT_IO_GROUP_NAME;
use crate::error::RpcError;
use crate::proto::codec::Codec;
use crate::proto::connection::{Connection, ConnectionId};
use crate::proto::handler::ConnectionHandler;
use crate::proto::registry::ConnectionRegistry;
use crate::transport::tcp_io::{spawn_tcp_connection, CloseHook};
use crate::transport::{socket_options, ClientTransport, ConnectFuture, GroupSlot, Side};
use async_trait::async_trait;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use strand_io::tokio::net::TcpStream;
use strand_io::tokio::runtime::Handle;
use strand_io::tokio_util::sync::CancellationToken;
use strand_io::SharedIoGroupManager;
use strand_types::config::ProtocolConfig;

/// Connects to TCP servers and runs the resulting connections on a worker
/// group
pub struct TcpClientTransport {
    inner: Arc<TcpClientInner>,
}

struct TcpClientInner {
    config: ProtocolConfig,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn ConnectionHandler>,
    group: GroupSlot,
    connections: Arc<ConnectionRegistry<ConnectionId>>,
    pool: Arc<ConnectionRegistry<SocketAddr>>,
    shutdown: CancellationToken,
}

impl TcpClientTransport {
    /// Shared worker groups come from the process-wide manager
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
        let group = GroupSlot::from_config(CLIENT_IO_GROUP_NAME, &config, manager);
        Self {
            inner: Arc::new(TcpClientInner {
                config,
                codec,
                handler,
                group,
                connections: Arc::new(ConnectionRegistry::new()),
                pool: Arc::new(ConnectionRegistry::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl TcpClientInner {
    fn adopt(&self, handle: &Handle, stream: TcpStream) -> Result<Connection, RpcError> {
        let pool = self.pool.clone();
        let on_close: CloseHook = Box::new(move |connection: &Connection| {
            if let Some(addr) = connection.remote_addr() {
                let _ = pool.remove_if_current(&addr, connection.id());
            }
        });

        spawn_tcp_connection(
            handle,
            stream,
            self.shutdown.child_token(),
            self.codec.clone(),
            &self.config,
            Side::Client,
            self.handler.clone(),
            &self.connections,
            Some(on_close),
        )
    }
}

#[async_trait]
impl ClientTransport for TcpClientTransport {
    fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    fn open(&self) -> Result<(), RpcError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::msg("transport has been closed"));
        }

        self.inner.config.validate()?;
        let _ = self.inner.group.open()?;
        Ok(())
    }

    fn connect(&self, addr: SocketAddr) -> ConnectFuture {
        let handle = match self.inner.group.handle() {
            Ok(handle) => handle,
            Err(err) => return ConnectFuture::ready(Err(err)),
        };

        let (mut tx, future) = ConnectFuture::channel();
        let inner = self.inner.clone();
        let task_handle = handle.clone();

        let _ = strand_io::spawn_on(&handle, async move {
            let options = socket_options(&inner.config).with_reuse_port(false);
            let timeout = inner.config.conn_timeout_duration();
            let attempt = strand_wire::socket_helpers::get_tcp_stream(addr, timeout, &options);

            let stream = strand_io::tokio::select! {
                _ = tx.closed() => {
                    log::trace!(target: "strand", "Connect to {addr} abandoned before completion");
                    return;
                }

                stream = attempt => stream,
            };

            let result = stream
                .map_err(|err| RpcError::Connect(format!("{addr}: {err}")))
                .and_then(|stream| inner.adopt(&task_handle, stream));

            if let Err(Ok(connection)) = tx.send(result) {
                log::trace!(target: "strand", "Connect to {addr} abandoned after completion; closing {connection:?}");
                connection.shutdown();
            }
        });

        future
    }

    async fn get_or_connect(&self, addr: SocketAddr) -> Result<Connection, RpcError> {
        if !self.inner.config.keep_alive {
            return self.connect(addr).await;
        }

        if let Some(pooled) = self.inner.pool.get(&addr).filter(Connection::is_connected) {
            return Ok(pooled);
        }

        let connection = self.connect(addr).await?;
        let pooled = self
            .inner
            .pool
            .get_or_insert_with::<Infallible>(addr, || Ok(connection.clone()));
        let (pooled, created) = match pooled {
            Ok(pooled) => pooled,
            Err(never) => match never {},
        };

        if !created {
            // another caller pooled a connection first
            connection.shutdown();
        }

        Ok(pooled)
    }

    fn connections(&self) -> Vec<Connection> {
        self.inner.connections.snapshot()
    }

    fn io_handle(&self) -> Result<Handle, RpcError> {
        self.inner.group.handle()
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
        for connection in self.inner.connections.snapshot() {
            connection.closed().await;
        }

        let _ = self.inner.pool.drain();
        self.inner.group.release();
        log::debug!(target: "strand", "TCP client transport closed");
    }
}
