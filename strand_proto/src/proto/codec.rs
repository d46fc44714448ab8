//! Codec Contract
//!
//! A [`Codec`] maps [`Message`]s to bytes and back. The transport never
//! interprets bytes itself; it only hands the codec a read view over what has
//! accumulated so far and observes how far the codec advanced it.
//!
//! # Important Notes
//! - `decode` may advance the view freely. When it answers
//!   [`DecodeResult::NotEnoughData`] the view is discarded and nothing counts
//!   as consumed, so a codec never has to rewind by hand
//! - A decoded message must consume at least one byte
//! - `encode` appends to the buffer; on failure the transport truncates
//!   whatever the codec wrote

use crate::error::RpcError;
use crate::proto::connection::Connection;
use auto_impl::auto_impl;
use bytes::{Buf, BytesMut};
use strand_types::proto::Message;

/// The outcome of one decode attempt
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete message was decoded
    Message(T),
    /// The buffer holds only part of the next message
    NotEnoughData,
    /// Bytes were consumed without producing a message
    Skipped,
}

impl<T> DecodeResult<T> {
    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message(..))
    }
}

#[auto_impl(Arc, Box)]
pub trait Codec: Send + Sync + 'static {
    fn encode(
        &self,
        connection: &Connection,
        buf: &mut BytesMut,
        message: &Message,
    ) -> Result<(), RpcError>;

    fn decode(
        &self,
        connection: &Connection,
        buf: &mut dyn Buf,
    ) -> Result<DecodeResult<Message>, RpcError>;
}
