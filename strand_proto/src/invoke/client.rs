use crate::error::RpcError;
use crate::invoke::pending::PendingCalls;
use crate::invoke::result_adapter::{
    deadline_from, race_with_backup_since, timeout_error, RequestSink, ResponseStream, StreamCall,
};
use crate::proto::codec::Codec;
use crate::proto::connection::Connection;
use crate::proto::handler::ConnectionHandler;
use crate::transport::{ClientTransport, TcpClientTransport, UdpClientTransport};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use strand_io::tokio::time::{timeout_at, Instant};
use strand_io::SharedIoGroupManager;
use strand_types::config::{Network, ProtocolConfig};
use strand_types::proto::{
    InvocationDescriptor, InvokeMode, Message, MethodCache, Request, RequestIdGenerator, Response,
};

/// Completes pending calls from inbound responses and fails them when their
/// connection goes away
struct ClientHandler {
    pending: PendingCalls,
}

impl ConnectionHandler for ClientHandler {
    fn received(&self, connection: &Connection, message: Message) {
        let response = match message {
            Message::Response(response) => response,
            Message::Request(request) => {
                log::warn!(target: "strand", "Client connection {connection:?} received request {}; dropping", request.request_id);
                return;
            }
        };

        if let Err(stray) = self.pending.complete(response) {
            log::debug!(target: "strand", "Dropping response {} with no pending call on {connection:?}", stray.request_id);
        }
    }

    fn disconnected(&self, connection: &Connection) {
        let _ = self
            .pending
            .fail_connection(connection.id(), RpcError::ConnectionClosed);
    }
}

/// The outcome of [`RpcClient::invoke`]
pub enum CallOutcome {
    Value(Bytes),
    ServerStream(ResponseStream),
    Stream(StreamCall),
}

/// Issues calls to the server at the configured address.
///
/// Every call registers its completion before the request is written, then
/// waits according to the method's invoke mode. With `keep_alive` the
/// transport reuses one connection per server; otherwise each call gets its
/// own connection, closed once the call completes
pub struct RpcClient {
    transport: Arc<dyn ClientTransport>,
    pending: PendingCalls,
    ids: RequestIdGenerator,
    methods: MethodCache,
    target: SocketAddr,
}

impl RpcClient {
    pub fn new(config: ProtocolConfig, codec: Arc<dyn Codec>) -> Result<Self, RpcError> {
        Self::with_manager(config, codec, SharedIoGroupManager::global().clone())
    }

    /// Like [`RpcClient::new`], joining `manager` when the config shares
    /// I/O groups
    pub fn with_manager(
        config: ProtocolConfig,
        codec: Arc<dyn Codec>,
        manager: SharedIoGroupManager,
    ) -> Result<Self, RpcError> {
        let pending = PendingCalls::new();
        let handler = Arc::new(ClientHandler {
            pending: pending.clone(),
        });

        let target = config.socket_addr();
        let transport: Arc<dyn ClientTransport> = match config.network {
            Network::Tcp => Arc::new(TcpClientTransport::with_manager(config, codec, handler, manager)),
            Network::Udp => Arc::new(UdpClientTransport::with_manager(config, codec, handler, manager)),
        };

        transport.open()?;
        log::debug!(target: "strand", "RPC client ready for {target}");

        Ok(Self {
            transport,
            pending,
            ids: RequestIdGenerator::new(),
            methods: MethodCache::new(),
            target,
        })
    }

    pub fn transport(&self) -> &Arc<dyn ClientTransport> {
        &self.transport
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Builds a request for `path` under a fresh id, using the configured
    /// request timeout
    pub fn new_request<T: Into<Bytes>>(&self, path: &str, mode: InvokeMode, payload: T) -> Request {
        let method = self.methods.get_or_insert(path, mode);
        let invocation =
            InvocationDescriptor::new(method, self.transport.config().request_timeout_duration());
        Request::new(self.ids.next_id(), invocation, payload).with_remote_addr(self.target)
    }

    fn destination(&self, request: &Request) -> SocketAddr {
        request.remote_addr.unwrap_or(self.target)
    }

    fn keep_alive(&self) -> bool {
        self.transport.config().keep_alive
    }

    /// Obtains a connection for `request` before the call's deadline. The
    /// connect attempt is abandoned once the deadline passes
    async fn connect_before_deadline(
        &self,
        request: &Request,
        started: Instant,
    ) -> Result<Connection, RpcError> {
        let deadline = deadline_from(&request.invocation, started);
        let connecting = self.transport.get_or_connect(self.destination(request));
        match timeout_at(deadline, connecting).await {
            Ok(connection) => connection,
            Err(_) => {
                log::debug!(target: "strand", "Call {} ran out of time while connecting", request.request_id);
                Err(timeout_error(&request.invocation))
            }
        }
    }

    async fn call_once(&self, connection: &Connection, request: Request) -> Result<Response, RpcError> {
        let pending = self
            .pending
            .register_unary(request.request_id, connection.id())?;
        connection.send(request).await?;
        pending.await
    }

    /// Sends `request` and waits for its value within the call timeout,
    /// racing a backup request when one is configured. The timeout covers
    /// obtaining the connection too
    pub async fn invoke_async(&self, request: Request) -> Result<Bytes, RpcError> {
        let started = Instant::now();
        let connection = self.connect_before_deadline(&request, started).await?;

        let invocation = request.invocation.clone();
        let template = invocation.backup_request_time.map(|_| request.clone());
        let backup_connection = &connection;
        let backup_invocation = &invocation;

        let backup = move || async move {
            let mut backup = match template {
                Some(template) => template.clone_for_backup(self.ids.next_id()),
                None => return Err(RpcError::msg("no backup request configured")),
            };

            // the backup inherits what is left of the link budget
            if let (Some(budget), Some(delay)) = (
                backup.invocation.link_timeout.as_mut(),
                backup_invocation.backup_request_time,
            ) {
                budget.subtract(delay);
            }

            log::trace!(target: "strand", "Backup request {} for {}", backup.request_id, backup_invocation.method.path());
            self.call_once(backup_connection, backup).await
        };

        let result = race_with_backup_since(
            &invocation,
            started,
            self.call_once(&connection, request),
            backup,
        )
        .await;

        if !self.keep_alive() {
            connection.shutdown();
        }

        result
    }

    /// Blocks the calling thread until [`RpcClient::invoke_async`] resolves.
    ///
    /// Drives the call on the transport's I/O group, so it must not be called
    /// from within an async context
    pub fn invoke_sync(&self, request: Request) -> Result<Bytes, RpcError> {
        let handle = self.transport.io_handle()?;
        handle.block_on(self.invoke_async(request))
    }

    async fn open_stream(
        &self,
        mut request: Request,
    ) -> Result<(Connection, Arc<Request>, ResponseStream), RpcError> {
        let connection = self
            .connect_before_deadline(&request, Instant::now())
            .await?;

        request.end_of_stream = !request.invocation.invoke_mode().streams_requests();
        let opening = Arc::new(request);
        let pending = self
            .pending
            .register_stream(opening.request_id, connection.id())?;
        connection.send(opening.as_ref().clone()).await?;

        let close_on_drop = (!self.keep_alive()).then(|| connection.clone());
        Ok((connection, opening, ResponseStream::new(pending, close_on_drop)))
    }

    /// Opens a call whose responses arrive as a stream
    pub async fn invoke_server_stream(&self, request: Request) -> Result<ResponseStream, RpcError> {
        let (_, _, responses) = self.open_stream(request).await?;
        Ok(responses)
    }

    /// Opens a call whose request frames follow the opening one
    pub async fn invoke_client_stream(&self, request: Request) -> Result<StreamCall, RpcError> {
        let (connection, opening, responses) = self.open_stream(request).await?;
        Ok(StreamCall {
            requests: RequestSink::new(connection, opening),
            responses,
        })
    }

    /// Opens a call streaming in both directions
    pub async fn invoke_duplex(&self, request: Request) -> Result<StreamCall, RpcError> {
        self.invoke_client_stream(request).await
    }

    /// Dispatches on the invoke mode cached in the request's method
    /// descriptor. Sync methods are awaited like async ones here; use
    /// [`RpcClient::invoke_sync`] to block outside a runtime
    pub async fn invoke(&self, request: Request) -> Result<CallOutcome, RpcError> {
        match request.invocation.invoke_mode() {
            InvokeMode::Sync | InvokeMode::Async => {
                self.invoke_async(request).await.map(CallOutcome::Value)
            }
            InvokeMode::ServerStream => self
                .invoke_server_stream(request)
                .await
                .map(CallOutcome::ServerStream),
            InvokeMode::ClientStream => self
                .invoke_client_stream(request)
                .await
                .map(CallOutcome::Stream),
            InvokeMode::DuplexStream => self.invoke_duplex(request).await.map(CallOutcome::Stream),
        }
    }

    /// Closes the transport. Calls still pending fail with
    /// [`RpcError::ConnectionClosed`]
    pub async fn close(&self) {
        self.transport.close().await
    }
}
