//! RPC Server
//!
//! Binds a server transport and dispatches every inbound request to a
//! [`Service`]. Each request runs on its own task, so a slow call never stalls
//! the connection it arrived on; the response goes back over that same
//! connection.
//!
//! # Features
//!
//! - Unary calls answered through [`Service::call`]
//! - Client, server and duplex streams through [`Service::call_stream`], with
//!   inbound request frames routed to the running call
//! - Calls carrying a link-timeout budget are bounded by what is left of it
//!
//! # Important Notes
//!
//! - A streaming call is closed with an end-of-stream frame once
//!   `call_stream` returns; an error becomes the closing frame
//! - Request frames for streams the server does not know, or that already
//!   returned, are dropped
//!
//! # Related Components
//!
//! - `transport`: the TCP and UDP server transports
//! - `invoke::result_adapter`: the client side of streaming calls

use crate::error::RpcError;
use crate::proto::codec::Codec;
use crate::proto::connection::{Connection, ConnectionId};
use crate::proto::handler::ConnectionHandler;
use crate::transport::{ServerTransport, TcpServerTransport, UdpServerTransport};
use async_trait::async_trait;
use auto_impl::auto_impl;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use strand_io::tokio::sync::mpsc;
use strand_io::tokio_stream::wrappers::UnboundedReceiverStream;
use strand_io::{Mutex, SharedIoGroupManager};
use strand_types::config::{Network, ProtocolConfig};
use strand_types::errors::RemoteError;
use strand_types::proto::{Message, Request, Response};

/// Business logic behind a server
#[async_trait]
#[auto_impl(Arc, Box)]
pub trait Service: Send + Sync + 'static {
    /// Answers a unary call
    async fn call(&self, request: Arc<Request>) -> Response;

    /// Runs a streaming call. `frames` yields the request frames that follow
    /// `request`; replies go out through `replies`
    async fn call_stream(
        &self,
        request: Arc<Request>,
        frames: RequestFrames,
        replies: StreamReplies,
    ) -> Result<(), RemoteError> {
        let _ = (frames, replies);
        Err(RemoteError::new(
            RemoteError::NOT_FOUND,
            format!("{} does not support streaming", request.invocation.method.path()),
        ))
    }
}

/// The request frames of a streaming call, after the opening one
pub struct RequestFrames {
    inner: Option<UnboundedReceiverStream<Bytes>>,
}

impl RequestFrames {
    fn new(rx: Option<mpsc::UnboundedReceiver<Bytes>>) -> Self {
        Self {
            inner: rx.map(UnboundedReceiverStream::new),
        }
    }
}

impl Stream for RequestFrames {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Writes the responses of a streaming call
#[derive(Clone)]
pub struct StreamReplies {
    connection: Connection,
    request: Arc<Request>,
}

impl StreamReplies {
    pub async fn send<T: Into<Bytes>>(&self, payload: T) -> Result<(), RpcError> {
        let frame = Response::success(self.request.clone(), payload).with_end_of_stream(false);
        self.connection.send(frame).await
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

type InboundKey = (ConnectionId, u32);

/// Adapts a [`Service`] to the transport's [`ConnectionHandler`]
pub struct DispatchHandler<S> {
    service: Arc<S>,
    inbound: Arc<Mutex<HashMap<InboundKey, mpsc::UnboundedSender<Bytes>>>>,
}

impl<S: Service> DispatchHandler<S> {
    pub fn new(service: S) -> Self {
        Self {
            service: Arc::new(service),
            inbound: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Routes a request frame. Returns false when no running call owns it
    fn route_frame(&self, key: InboundKey, request: &Request) -> bool {
        let mut inbound = self.inbound.lock();
        if request.end_of_stream {
            return inbound.remove(&key).is_some();
        }

        match inbound.get(&key) {
            Some(frames) => {
                let _ = frames.send(request.payload.clone());
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn inbound_len(&self) -> usize {
        self.inbound.lock().len()
    }

    fn spawn_unary(&self, connection: Connection, request: Arc<Request>) {
        let service = self.service.clone();
        let _ = strand_io::spawn(async move {
            let call = service.call(request.clone());
            let response = match request.invocation.link_timeout {
                Some(budget) => match strand_io::tokio::time::timeout(budget.remaining(), call).await {
                    Ok(response) => response,
                    Err(_) => {
                        log::debug!(target: "strand", "Call {} exhausted its link budget", request.request_id);
                        Response::failure(
                            request.clone(),
                            RemoteError::new(RemoteError::TIMEOUT, "link timeout budget exhausted"),
                        )
                    }
                },
                None => call.await,
            };

            reply(&connection, &request, response).await
        });
    }

    fn spawn_stream(&self, connection: Connection, request: Arc<Request>, frames: RequestFrames) {
        let service = self.service.clone();
        let inbound = self.inbound.clone();
        let key = (connection.id(), request.request_id);
        let replies = StreamReplies {
            connection: connection.clone(),
            request: request.clone(),
        };

        let _ = strand_io::spawn(async move {
            let outcome = service.call_stream(request.clone(), frames, replies).await;
            // frames arriving after this are dropped
            let _ = inbound.lock().remove(&key);

            let closing = match outcome {
                Ok(()) => Response::success(request.clone(), Bytes::new()),
                Err(err) => Response::failure(request.clone(), err),
            };

            reply(&connection, &request, closing).await
        });
    }
}

/// Sends the final response of a call
async fn reply(connection: &Connection, request: &Arc<Request>, mut response: Response) {
    response.request_id = request.request_id;
    response.end_of_stream = true;
    if response.request.is_none() {
        response.request = Some(request.clone());
    }

    if let Err(err) = connection.send(response).await {
        log::debug!(target: "strand", "Unable to answer request {} on {connection:?}: {err:?}", request.request_id);
    }
}

impl<S: Service> ConnectionHandler for DispatchHandler<S> {
    fn received(&self, connection: &Connection, message: Message) {
        let request = match message {
            Message::Request(request) => request,
            Message::Response(response) => {
                log::warn!(target: "strand", "Server connection {connection:?} received response {}; dropping", response.request_id);
                return;
            }
        };

        let mode = request.invocation.invoke_mode();
        let key = (connection.id(), request.request_id);

        if request.continuation {
            if !self.route_frame(key, &request) {
                log::trace!(target: "strand", "Dropping frame of finished stream {} on {connection:?}", request.request_id);
            }
            return;
        }

        if mode.streams_requests() {
            let frames = if request.end_of_stream {
                None
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = self.inbound.lock().insert(key, tx);
                Some(rx)
            };

            self.spawn_stream(connection.clone(), Arc::new(request), RequestFrames::new(frames));
        } else if mode.streams_responses() {
            self.spawn_stream(connection.clone(), Arc::new(request), RequestFrames::new(None));
        } else {
            self.spawn_unary(connection.clone(), Arc::new(request));
        }
    }

    fn disconnected(&self, connection: &Connection) {
        self.inbound
            .lock()
            .retain(|(owner, _), _| *owner != connection.id());
    }

    fn faulted(&self, connection: &Connection, err: &RpcError) {
        log::debug!(target: "strand", "Server connection {connection:?} faulted: {err:?}");
    }
}

/// A bound server dispatching to a [`Service`]
pub struct RpcServer {
    transport: Box<dyn ServerTransport>,
    local_addr: SocketAddr,
}

impl RpcServer {
    pub fn open<S: Service>(
        config: ProtocolConfig,
        codec: Arc<dyn Codec>,
        service: S,
    ) -> Result<Self, RpcError> {
        Self::open_with_manager(config, codec, service, SharedIoGroupManager::global().clone())
    }

    pub fn open_with_manager<S: Service>(
        config: ProtocolConfig,
        codec: Arc<dyn Codec>,
        service: S,
        manager: SharedIoGroupManager,
    ) -> Result<Self, RpcError> {
        let handler = Arc::new(DispatchHandler::new(service));
        let transport: Box<dyn ServerTransport> = match config.network {
            Network::Tcp => Box::new(TcpServerTransport::with_manager(config, codec, handler, manager)),
            Network::Udp => Box::new(UdpServerTransport::with_manager(config, codec, handler, manager)),
        };

        let local_addr = transport.open()?;
        Ok(Self {
            transport,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channels(&self) -> Vec<Connection> {
        self.transport.channels()
    }

    pub fn bound_sockets(&self) -> usize {
        self.transport.bound_sockets()
    }

    pub async fn close(&self) {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use strand_io::tokio::time::sleep;
    use strand_types::proto::{InvocationDescriptor, InvokeMode, MethodCache};

    /// Finishes every stream without reading its request frames
    struct Hasty {
        streams: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for Hasty {
        async fn call(&self, request: Arc<Request>) -> Response {
            Response::success(request, "")
        }

        async fn call_stream(
            &self,
            _request: Arc<Request>,
            _frames: RequestFrames,
            _replies: StreamReplies,
        ) -> Result<(), RemoteError> {
            let _ = self.streams.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn opening(request_id: u32) -> Request {
        let method = MethodCache::new().get_or_insert("/sum", InvokeMode::ClientStream);
        let mut request = Request::new(request_id, InvocationDescriptor::new(method, Duration::from_secs(1)), "1");
        request.end_of_stream = false;
        request
    }

    #[tokio::test]
    async fn finished_streams_release_their_frame_route() {
        let streams = Arc::new(AtomicUsize::new(0));
        let handler = DispatchHandler::new(Hasty {
            streams: streams.clone(),
        });
        let connection = Connection::detached(Network::Tcp, "127.0.0.1:1".parse().unwrap(), None);

        let opening = opening(3);
        handler.received(&connection, Message::Request(opening.clone()));
        assert_eq!(handler.inbound_len(), 1);

        for _ in 0..100 {
            if handler.inbound_len() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.inbound_len(), 0);

        // late frames neither reopen the call nor leave a route behind
        handler.received(&connection, Message::Request(opening.stream_frame("2", false)));
        handler.received(&connection, Message::Request(opening.stream_frame(Bytes::new(), true)));
        sleep(Duration::from_millis(50)).await;

        assert_eq!(handler.inbound_len(), 0);
        assert_eq!(streams.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_drops_routes_of_that_connection_only() {
        let handler = DispatchHandler::new(Hasty {
            streams: Arc::new(AtomicUsize::new(0)),
        });
        let first = Connection::detached(Network::Tcp, "127.0.0.1:1".parse().unwrap(), None);
        let second = Connection::detached(Network::Tcp, "127.0.0.1:2".parse().unwrap(), None);

        handler.received(&first, Message::Request(opening(1)));
        handler.received(&second, Message::Request(opening(1)));
        assert_eq!(handler.inbound_len(), 2);

        handler.disconnected(&first);
        assert_eq!(handler.inbound_len(), 1);
    }
}
