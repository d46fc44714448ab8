use crate::constants::CLIENT_IO_GROUP_NAME;
use crate::error::RpcError;
use crate::proto::adapter::DatagramCodecAdapter;
use crate::proto::codec::Codec;
use crate::proto::connection::Connection;
use crate::proto::handler::ConnectionHandler;
use crate::transport::udp_io::{PeerIdle, UdpEndpoint};
use crate::transport::{socket_options, ClientTransport, ConnectFuture, GroupSlot, Side};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use strand_io::tokio::runtime::Handle;
use strand_io::tokio_util::sync::CancellationToken;
use strand_io::{Mutex, SharedIoGroupManager};
use strand_types::config::ProtocolConfig;

/// Talks to UDP servers through one ephemeral socket. Each remote address is a
/// peer connection on that socket; datagrams from addresses the transport never
/// connected to are dropped
pub struct UdpClientTransport {
    config: ProtocolConfig,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn ConnectionHandler>,
    group: GroupSlot,
    endpoint: Mutex<Option<Arc<UdpEndpoint>>>,
    shutdown: CancellationToken,
}

impl UdpClientTransport {
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
            config,
            codec,
            handler,
            group,
            endpoint: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// The address of the ephemeral socket, once open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.lock().as_ref().map(|endpoint| endpoint.local_addr())
    }

    fn endpoint(&self) -> Result<Arc<UdpEndpoint>, RpcError> {
        self.endpoint
            .lock()
            .clone()
            .ok_or_else(|| RpcError::msg("transport is not open"))
    }
}

#[async_trait]
impl ClientTransport for UdpClientTransport {
    fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn open(&self) -> Result<(), RpcError> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::msg("transport has been closed"));
        }

        self.config.validate()?;
        let mut slot = self.endpoint.lock();
        if slot.is_some() {
            return Ok(());
        }

        let handle = self.group.open()?;
        let unspecified = if self.config.ip.is_ipv6() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };

        let options = socket_options(&self.config).with_reuse_port(false);
        let socket = {
            let _guard = handle.enter();
            strand_wire::socket_helpers::get_udp_socket(SocketAddr::new(unspecified, 0), &options)
        };

        let socket = match socket {
            Ok(socket) => socket,
            Err(err) => {
                self.group.release();
                return Err(RpcError::Bind(err.to_string()));
            }
        };

        let adapter = Arc::new(DatagramCodecAdapter::new(self.codec.clone()));
        let endpoint = UdpEndpoint::new(
            socket,
            adapter,
            self.handler.clone(),
            self.shutdown.child_token(),
            handle.clone(),
            PeerIdle::new(&self.config, Side::Client),
        )?;

        log::debug!(target: "strand", "UDP client bound to {}", endpoint.local_addr());
        let _ = strand_io::spawn_on(&handle, endpoint.clone().recv_loop(false));
        *slot = Some(endpoint);
        Ok(())
    }

    fn connect(&self, addr: SocketAddr) -> ConnectFuture {
        ConnectFuture::ready(self.endpoint().map(|endpoint| endpoint.peer(addr)))
    }

    async fn get_or_connect(&self, addr: SocketAddr) -> Result<Connection, RpcError> {
        // peers are unique per address, so pooling is inherent
        self.connect(addr).await
    }

    fn connections(&self) -> Vec<Connection> {
        self.endpoint
            .lock()
            .as_ref()
            .map(|endpoint| endpoint.peers().snapshot())
            .unwrap_or_default()
    }

    fn io_handle(&self) -> Result<Handle, RpcError> {
        self.group.handle()
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let endpoint = self.endpoint.lock().take();
        if let Some(endpoint) = endpoint {
            for peer in endpoint.peers().snapshot() {
                peer.closed().await;
            }
        }

        self.group.release();
        log::debug!(target: "strand", "UDP client transport closed");
    }
}
