use crate::error::RpcError;
use crate::proto::connection::Connection;
use auto_impl::auto_impl;
use strand_types::proto::Message;

/// Upcalls a transport makes for each of its connections. All of them run on
/// the connection's own I/O task, so they never overlap for one connection;
/// they must not block.
#[auto_impl(Arc, Box)]
pub trait ConnectionHandler: Send + Sync + 'static {
    fn connected(&self, _connection: &Connection) {}

    fn disconnected(&self, _connection: &Connection) {}

    /// A decoded inbound message, in arrival order
    fn received(&self, connection: &Connection, message: Message);

    /// `message` has been handed to the socket
    fn sent(&self, _connection: &Connection, _message: &Message) {}

    fn faulted(&self, _connection: &Connection, _error: &RpcError) {}
}
