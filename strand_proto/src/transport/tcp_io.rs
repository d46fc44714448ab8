//! TCP Connection Task
//!
//! Each TCP connection is driven by exactly one task that reads, decodes,
//! dispatches, encodes and writes. Nothing it owns is shared, so the framing
//! state needs no lock and handler upcalls for one connection never overlap.
//!
//! # Important Notes
//!
//! - Server connections go idle on inbound silence only; client connections
//!   count outbound traffic as activity too
//! - With flush consolidation, queued messages are coalesced into a single
//!   write of at most `explicit_flush_after_flushes` messages
//! - On every exit path the buffered tail is decoded, pending sends are
//!   failed, and the handler sees `disconnected` exactly once

use crate::constants::{READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};
use crate::error::RpcError;
use crate::proto::adapter::StreamCodecAdapter;
use crate::proto::codec::Codec;
use crate::proto::connection::{Connection, ConnectionId, Outbound, OutboundReceiver};
use crate::proto::handler::ConnectionHandler;
use crate::proto::registry::ConnectionRegistry;
use crate::transport::{idle_until, Side};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use strand_io::tokio::io::{AsyncReadExt, AsyncWriteExt};
use strand_io::tokio::net::tcp::OwnedWriteHalf;
use strand_io::tokio::net::TcpStream;
use strand_io::tokio::runtime::Handle;
use strand_io::tokio::time::Instant;
use strand_io::tokio_util::sync::CancellationToken;
use strand_types::config::{Network, ProtocolConfig};
use strand_types::proto::Message;

pub(crate) type CloseHook = Box<dyn FnOnce(&Connection) + Send>;

#[derive(Copy, Clone, Debug)]
pub(crate) struct TcpTaskSettings {
    idle_timeout: Option<Duration>,
    outbound_is_activity: bool,
    flush_consolidation: bool,
    explicit_flush_after: usize,
}

impl TcpTaskSettings {
    pub fn new(config: &ProtocolConfig, side: Side) -> Self {
        Self {
            idle_timeout: config.idle_timeout_duration(),
            outbound_is_activity: side == Side::Client,
            flush_consolidation: config.flush_consolidation,
            explicit_flush_after: config.explicit_flush_after_flushes.max(1),
        }
    }
}

enum Exit {
    Local,
    Eof,
    Idle,
    Fault(RpcError),
}

/// Adopts `stream` as a [`Connection`] and spawns its task on `handle`
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_tcp_connection(
    handle: &Handle,
    stream: TcpStream,
    shutdown: CancellationToken,
    codec: Arc<dyn Codec>,
    config: &ProtocolConfig,
    side: Side,
    handler: Arc<dyn ConnectionHandler>,
    registry: &Arc<ConnectionRegistry<ConnectionId>>,
    on_close: Option<CloseHook>,
) -> Result<Connection, RpcError> {
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);
    let (connection, outbound) = Connection::new(Network::Tcp, local_addr, Some(remote_addr), shutdown);
    log::debug!(target: "strand", "Adopted {side:?} connection {connection:?}");

    let task = TcpConnectionTask {
        connection: connection.clone(),
        adapter: StreamCodecAdapter::from_config(codec, config),
        handler,
        settings: TcpTaskSettings::new(config, side),
        write_buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
    };

    // registered before the task exists, so its removal can never run first
    let _ = registry.insert(connection.id(), connection.clone());
    let registry = registry.clone();
    let on_close: CloseHook = Box::new(move |connection: &Connection| {
        let _ = registry.remove_if_current(&connection.id(), connection.id());
        if let Some(on_close) = on_close {
            on_close(connection)
        }
    });

    let _ = strand_io::spawn_on(handle, task.run(stream, outbound, on_close));
    Ok(connection)
}

struct TcpConnectionTask {
    connection: Connection,
    adapter: StreamCodecAdapter,
    handler: Arc<dyn ConnectionHandler>,
    settings: TcpTaskSettings,
    write_buf: BytesMut,
}

impl TcpConnectionTask {
    async fn run(mut self, stream: TcpStream, mut outbound: OutboundReceiver, on_close: CloseHook) {
        let (mut reader, mut writer) = stream.into_split();
        let shutdown = self.connection.shutdown_token().clone();
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut last_activity = Instant::now();

        self.handler.connected(&self.connection);

        let exit = loop {
            let idle_deadline = self
                .settings
                .idle_timeout
                .map(|timeout| last_activity + timeout);

            strand_io::tokio::select! {
                biased;

                _ = shutdown.cancelled() => break Exit::Local,

                read = reader.read_buf(&mut read_buf) => match read {
                    Ok(0) => break Exit::Eof,
                    Ok(_) => {
                        last_activity = Instant::now();
                        let chunk = read_buf.split();
                        read_buf.reserve(READ_BUFFER_SIZE);
                        if let Err(err) = self.on_chunk(chunk) {
                            break Exit::Fault(err);
                        }
                    }
                    Err(err) => break Exit::Fault(err.into()),
                },

                next = outbound.recv() => match next {
                    Some(next) => {
                        if self.settings.outbound_is_activity {
                            last_activity = Instant::now();
                        }
                        if let Err(err) = self.flush(&mut writer, next, &mut outbound).await {
                            break Exit::Fault(err);
                        }
                    }
                    None => break Exit::Local,
                },

                _ = idle_until(idle_deadline) => break Exit::Idle,
            }
        };

        self.connection.mark_disconnected();

        match &exit {
            Exit::Local => {
                log::trace!(target: "strand", "Closing {:?} locally", self.connection)
            }
            Exit::Eof => {
                log::trace!(target: "strand", "Peer closed {:?}", self.connection)
            }
            Exit::Idle => {
                log::debug!(target: "strand", "Closing idle {:?} after {:?}", self.connection, self.settings.idle_timeout)
            }
            Exit::Fault(err) => {
                log::warn!(target: "strand", "Fault on {:?}: {err:?}", self.connection);
                self.handler.faulted(&self.connection, err);
            }
        }

        if !matches!(exit, Exit::Fault(..)) {
            let mut tail = Vec::new();
            let result = self.adapter.decode_last(&self.connection, &mut tail);
            self.dispatch(tail);
            if let Err(err) = result {
                log::warn!(target: "strand", "Discarding undecodable tail of {:?}: {err:?}", self.connection);
                self.handler.faulted(&self.connection, &err);
            }
        }

        outbound.close();
        while let Ok(pending) = outbound.try_recv() {
            let _ = pending.acknowledge(Err(RpcError::ConnectionClosed));
        }

        let _ = writer.shutdown().await;
        drop(reader);

        on_close(&self.connection);
        self.handler.disconnected(&self.connection);
        self.connection.mark_terminated();
    }

    fn on_chunk(&mut self, chunk: BytesMut) -> Result<(), RpcError> {
        let mut batch = Vec::new();
        let result = self.adapter.decode(&self.connection, chunk, &mut batch);
        self.dispatch(std::mem::take(&mut batch));
        result?;

        if self.adapter.decoder().is_single_decode() {
            loop {
                self.adapter.decode_pending(&self.connection, &mut batch)?;
                if batch.is_empty() {
                    break;
                }
                self.dispatch(std::mem::take(&mut batch));
            }
        }

        Ok(())
    }

    fn dispatch(&self, messages: Vec<Message>) {
        for message in messages {
            self.handler.received(&self.connection, message);
        }
    }

    async fn flush(
        &mut self,
        writer: &mut OwnedWriteHalf,
        first: Outbound,
        outbound: &mut OutboundReceiver,
    ) -> Result<(), RpcError> {
        let mut batch = vec![first];
        if self.settings.flush_consolidation {
            while batch.len() < self.settings.explicit_flush_after {
                match outbound.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) => break,
                }
            }
        }

        self.write_buf.clear();
        let mut written = Vec::with_capacity(batch.len());
        for next in batch {
            match self
                .adapter
                .encode(&self.connection, &mut self.write_buf, &next.message)
            {
                Ok(()) => written.push(next),
                Err(err) => {
                    log::warn!(target: "strand", "Dropping message {} on {:?}: {err:?}", next.message.request_id(), self.connection);
                    let _ = next.acknowledge(Err(err));
                }
            }
        }

        if self.write_buf.is_empty() {
            return Ok(());
        }

        if let Err(err) = writer.write_all(&self.write_buf).await {
            for next in written {
                let _ = next.acknowledge(Err(RpcError::ConnectionClosed));
            }
            return Err(err.into());
        }

        for next in written {
            let message = next.acknowledge(Ok(()));
            self.handler.sent(&self.connection, &message);
        }

        Ok(())
    }
}
