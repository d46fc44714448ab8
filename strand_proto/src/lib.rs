//! # Strand Protocol
//!
//! The transport and invocation engine of the Strand RPC framework. It turns
//! logical requests and responses into framed bytes on TCP and UDP
//! connections, manages connection and I/O thread group lifecycles, and adapts
//! asynchronous completions into sync, async and streaming call semantics.
//!
//! ## Features
//!
//! - **Framing**: a cumulating decoder that never decodes a byte twice, with
//!   merge and composite buffer strategies and batch or single-message modes
//! - **Codecs**: a pluggable [`Codec`](proto::codec::Codec) contract, stream
//!   and datagram adapters, and a length-prefixed reference codec
//! - **Transports**: TCP and UDP clients and servers on private or shared I/O
//!   thread groups, with keep-alive pooling, idle timeouts and multi-bind
//! - **Invocation**: call timeouts, link-timeout budgets, backup-request races
//!   and streaming calls in both directions
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strand_proto::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Service for Echo {
//!     async fn call(&self, request: Arc<Request>) -> Response {
//!         let payload = request.payload.clone();
//!         Response::success(request, payload)
//!     }
//! }
//!
//! fn main() -> Result<(), RpcError> {
//!     let codec = Arc::new(LengthPrefixedCodec::default());
//!     let server = RpcServer::open(ProtocolConfig::tcp(), codec.clone(), Echo)?;
//!
//!     let client = RpcClient::new(ProtocolConfig::tcp().with_addr(server.local_addr()), codec)?;
//!     let request = client.new_request("/echo", InvokeMode::Sync, "ping");
//!     assert_eq!(client.invoke_sync(request)?.as_ref(), b"ping");
//!     Ok(())
//! }
//! ```
#![forbid(unsafe_code)]
#![deny(
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_features
)]

pub mod constants;
pub mod error;
pub mod invoke;
pub mod proto;
pub mod server;
pub mod transport;

pub mod prelude {
    pub use crate::error::RpcError;
    pub use crate::invoke::{CallOutcome, RequestSink, ResponseStream, RpcClient, StreamCall};
    pub use crate::proto::codec::{Codec, DecodeResult};
    pub use crate::proto::connection::{Connection, ConnectionId};
    pub use crate::proto::handler::ConnectionHandler;
    pub use crate::proto::wire_codec::LengthPrefixedCodec;
    pub use crate::server::{RequestFrames, RpcServer, Service, StreamReplies};
    pub use crate::transport::{ClientTransport, ServerTransport};
    pub use strand_types::prelude::*;
}
