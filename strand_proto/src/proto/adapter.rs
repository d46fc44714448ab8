//! Codec Adapters
//!
//! Bridge a [`Codec`] onto the two transport shapes. The stream adapter owns a
//! [`FramingDecoder`] and therefore belongs to a single TCP connection; the
//! datagram adapter is stateless and shared by every peer of a UDP socket.
//!
//! # Features
//!
//! - Address stamping: decoded requests learn where they came from
//! - Datagram destination resolution for outbound messages
//! - Encode failures roll the outbound buffer back to where it was
//!
//! # Related Components
//!
//! - `proto::framing`: stream reassembly
//! - `transport::tcp_io` / `transport::udp_io`: the callers

use crate::error::RpcError;
use crate::proto::codec::{Codec, DecodeResult};
use crate::proto::connection::Connection;
use crate::proto::framing::FramingDecoder;
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use strand_types::config::ProtocolConfig;
use strand_types::proto::Message;

fn encode_rollback(
    codec: &dyn Codec,
    connection: &Connection,
    buf: &mut BytesMut,
    message: &Message,
) -> Result<(), RpcError> {
    let mark = buf.len();
    if let Err(err) = codec.encode(connection, buf, message) {
        buf.truncate(mark);
        return Err(err);
    }

    Ok(())
}

/// Per-connection adapter for byte streams
pub struct StreamCodecAdapter {
    codec: Arc<dyn Codec>,
    decoder: FramingDecoder,
}

impl StreamCodecAdapter {
    pub fn new(codec: Arc<dyn Codec>, decoder: FramingDecoder) -> Self {
        Self { codec, decoder }
    }

    pub fn from_config(codec: Arc<dyn Codec>, config: &ProtocolConfig) -> Self {
        Self::new(codec, FramingDecoder::from_config(config))
    }

    pub fn decoder(&self) -> &FramingDecoder {
        &self.decoder
    }

    pub fn encode(
        &self,
        connection: &Connection,
        buf: &mut BytesMut,
        message: &Message,
    ) -> Result<(), RpcError> {
        encode_rollback(&*self.codec, connection, buf, message)
    }

    /// Feeds one inbound chunk through the framing decoder. Messages decoded
    /// before a failure are still appended to `out`
    pub fn decode(
        &mut self,
        connection: &Connection,
        chunk: BytesMut,
        out: &mut Vec<Message>,
    ) -> Result<(), RpcError> {
        let start = out.len();
        let result = self
            .decoder
            .decode_chunk(&*self.codec, connection, chunk, out);
        stamp_stream(connection, &mut out[start..]);
        result
    }

    pub fn decode_pending(
        &mut self,
        connection: &Connection,
        out: &mut Vec<Message>,
    ) -> Result<(), RpcError> {
        let start = out.len();
        let result = self.decoder.decode_pending(&*self.codec, connection, out);
        stamp_stream(connection, &mut out[start..]);
        result
    }

    pub fn decode_last(
        &mut self,
        connection: &Connection,
        out: &mut Vec<Message>,
    ) -> Result<(), RpcError> {
        let start = out.len();
        let result = self.decoder.decode_last(&*self.codec, connection, out);
        stamp_stream(connection, &mut out[start..]);
        result
    }
}

fn stamp_stream(connection: &Connection, messages: &mut [Message]) {
    for request in messages.iter_mut().filter_map(Message::as_request_mut) {
        request.remote_addr = connection.remote_addr();
        request.local_addr = Some(connection.local_addr());
    }
}

/// Shared adapter for datagram sockets
pub struct DatagramCodecAdapter {
    codec: Arc<dyn Codec>,
}

impl DatagramCodecAdapter {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self { codec }
    }

    /// Decodes every message packed into `datagram`, stamping `sender` onto
    /// requests. A failure abandons the rest of the datagram; messages decoded
    /// before it are still appended to `out`
    pub fn decode(
        &self,
        connection: &Connection,
        sender: SocketAddr,
        datagram: Bytes,
        out: &mut Vec<Message>,
    ) -> Result<(), RpcError> {
        let mut buf = datagram;
        while buf.has_remaining() {
            let before = buf.remaining();
            let mut view = buf.clone();
            let result = self.codec.decode(connection, &mut view)?;
            let consumed = before - view.remaining();
            match result {
                DecodeResult::Message(mut message) => {
                    if consumed == 0 {
                        return Err(RpcError::Decode(
                            "codec produced a message without consuming bytes".into(),
                        ));
                    }

                    if let Some(request) = message.as_request_mut() {
                        request.remote_addr = Some(sender);
                        request.local_addr = Some(connection.local_addr());
                    }

                    out.push(message);
                }

                DecodeResult::Skipped if consumed > 0 => {}

                DecodeResult::Skipped => break,

                DecodeResult::NotEnoughData => {
                    return Err(RpcError::Decode(format!(
                        "datagram from {sender} ends inside a frame ({} bytes left)",
                        buf.remaining()
                    )));
                }
            }

            buf.advance(consumed);
        }

        Ok(())
    }

    /// Encodes `message` and resolves where it must be sent. Responses go back
    /// to the sender of their request; requests go to their own destination.
    /// Either falls back to the connection's peer
    pub fn encode(
        &self,
        connection: &Connection,
        message: &Message,
    ) -> Result<(SocketAddr, BytesMut), RpcError> {
        let destination = match message {
            Message::Request(request) => request.remote_addr,
            Message::Response(response) => response
                .request
                .as_ref()
                .and_then(|request| request.remote_addr),
        }
        .or_else(|| connection.remote_addr())
        .ok_or_else(|| {
            RpcError::Encode(format!(
                "no destination address for message {}",
                message.request_id()
            ))
        })?;

        let mut buf = BytesMut::new();
        encode_rollback(&*self.codec, connection, &mut buf, message)?;
        Ok((destination, buf))
    }
}
