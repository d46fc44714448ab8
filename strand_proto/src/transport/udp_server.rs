use crate::constants::SERVER_IO_GROUP_NAME;
use crate::error::RpcError;
use crate::proto::adapter::DatagramCodecAdapter;
use crate::proto::codec::Codec;
use crate::proto::connection::Connection;
use crate::proto::handler::ConnectionHandler;
use crate::transport::udp_io::{PeerIdle, UdpEndpoint};
use crate::transport::{bind_count, socket_options, GroupSlot, ServerTransport, Side};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use strand_io::tokio::net::UdpSocket;
use strand_io::tokio::runtime::Handle;
use strand_io::tokio_util::sync::CancellationToken;
use strand_io::{Mutex, SharedIoGroupManager};
use strand_types::config::ProtocolConfig;

/// Serves datagrams on one or more bound sockets. Every distinct sender becomes
/// a peer connection of the socket it wrote to
pub struct UdpServerTransport {
    config: ProtocolConfig,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn ConnectionHandler>,
    group: GroupSlot,
    endpoints: Mutex<Vec<Arc<UdpEndpoint>>>,
    shutdown: CancellationToken,
}

impl UdpServerTransport {
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
            config,
            codec,
            handler,
            group,
            endpoints: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn bind_all(&self, handle: &Handle) -> Result<Vec<UdpSocket>, RpcError> {
        let options = socket_options(&self.config);
        let mut addr = self.config.socket_addr();
        let mut sockets = Vec::new();
        let _guard = handle.enter();

        for _ in 0..bind_count(&self.config) {
            let socket = strand_wire::socket_helpers::get_udp_socket(addr, &options)
                .map_err(|err| RpcError::Bind(format!("{addr}: {err}")))?;
            addr = socket.local_addr()?;
            sockets.push(socket);
        }

        Ok(sockets)
    }
}

#[async_trait]
impl ServerTransport for UdpServerTransport {
    fn open(&self) -> Result<SocketAddr, RpcError> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::msg("transport has been closed"));
        }

        let mut endpoints = self.endpoints.lock();
        if let Some(endpoint) = endpoints.first() {
            return Ok(endpoint.local_addr());
        }

        self.config.validate()?;
        let handle = self.group.open()?;
        let sockets = match self.bind_all(&handle) {
            Ok(sockets) => sockets,
            Err(err) => {
                log::error!(target: "strand", "UDP server failed to bind: {err:?}");
                self.group.release();
                return Err(err);
            }
        };

        let adapter = Arc::new(DatagramCodecAdapter::new(self.codec.clone()));
        for socket in sockets {
            let endpoint = UdpEndpoint::new(
                socket,
                adapter.clone(),
                self.handler.clone(),
                self.shutdown.child_token(),
                handle.clone(),
                PeerIdle::new(&self.config, Side::Server),
            )?;
            let _ = strand_io::spawn_on(&handle, endpoint.clone().recv_loop(true));
            endpoints.push(endpoint);
        }

        let local_addr = endpoints
            .first()
            .map(|endpoint| endpoint.local_addr())
            .ok_or_else(|| RpcError::Bind("no socket was bound".to_string()))?;
        log::info!(target: "strand", "UDP server listening on {local_addr} ({} sockets)", endpoints.len());
        Ok(local_addr)
    }

    fn channels(&self) -> Vec<Connection> {
        self.endpoints
            .lock()
            .iter()
            .flat_map(|endpoint| endpoint.peers().snapshot())
            .collect()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoints
            .lock()
            .first()
            .map(|endpoint| endpoint.local_addr())
    }

    fn bound_sockets(&self) -> usize {
        self.endpoints.lock().len()
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let endpoints = std::mem::take(&mut *self.endpoints.lock());
        for endpoint in endpoints {
            for peer in endpoint.peers().snapshot() {
                peer.closed().await;
            }
        }

        self.group.release();
        log::debug!(target: "strand", "UDP server transport closed");
    }
}
