//! Framing Decoder
//!
//! Turns the inbound chunks of one connection into an ordered sequence of
//! decoded messages without decoding any byte twice.
//!
//! # Features
//!
//! - Pluggable accumulation through a [`Cumulator`]
//! - Batch mode (drain every complete message per chunk) or strict single
//!   mode (at most one message per call, resumed with
//!   [`FramingDecoder::decode_pending`])
//! - Periodic compaction of the consumed prefix
//! - A final pass on close so complete tail messages are never lost
//!
//! # Important Notes
//!
//! - One decoder belongs to exactly one connection task, so it needs no lock
//! - Any decode error discards every unread byte
//! - A codec that reports a message without consuming bytes is a programming
//!   error and fails fast
//!
//! # Related Components
//!
//! - `proto::cumulation`: the buffer and its strategies
//! - `proto::adapter`: stamps addresses onto what this decoder produces

use crate::error::RpcError;
use crate::proto::codec::{Codec, DecodeResult};
use crate::proto::connection::Connection;
use crate::proto::cumulation::{cumulator_for, Cumulation, Cumulator};
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use strand_types::config::ProtocolConfig;
use strand_types::proto::Message;

pub struct FramingDecoder {
    cumulator: Arc<dyn Cumulator>,
    cumulation: Option<Cumulation>,
    single_decode: bool,
    discard_after_reads: usize,
    num_reads: usize,
}

enum Step {
    Emit(Message, usize),
    Skip(usize),
    Stop,
}

impl FramingDecoder {
    pub fn new(cumulator: Arc<dyn Cumulator>, single_decode: bool, discard_after_reads: usize) -> Self {
        Self {
            cumulator,
            cumulation: None,
            single_decode,
            discard_after_reads: discard_after_reads.max(1),
            num_reads: 0,
        }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(
            cumulator_for(config.cumulator),
            !config.batch_decoder,
            config.discard_after_reads,
        )
    }

    pub fn is_single_decode(&self) -> bool {
        self.single_decode
    }

    /// Unread bytes currently held
    pub fn buffered(&self) -> usize {
        self.cumulation.as_ref().map(Cumulation::len).unwrap_or(0)
    }

    /// The reader index of the live buffer, if one is held
    pub fn reader_index(&self) -> Option<usize> {
        self.cumulation.as_ref().map(Cumulation::reader_index)
    }

    /// Accumulates `chunk` and appends every message it completes to `out`
    pub fn decode_chunk<C: Codec + ?Sized>(
        &mut self,
        codec: &C,
        connection: &Connection,
        chunk: BytesMut,
        out: &mut Vec<Message>,
    ) -> Result<(), RpcError> {
        let cumulation = self.cumulator.cumulate(self.cumulation.take(), chunk);
        self.cumulation = Some(cumulation);
        let result = self.call_decode(codec, connection, out);
        self.finish_read();
        result
    }

    /// Continues decoding the bytes already held, without new input. Only
    /// meaningful in single mode, where a chunk may complete several messages
    pub fn decode_pending<C: Codec + ?Sized>(
        &mut self,
        codec: &C,
        connection: &Connection,
        out: &mut Vec<Message>,
    ) -> Result<(), RpcError> {
        if self.cumulation.is_none() {
            return Ok(());
        }

        let result = self.call_decode(codec, connection, out);
        if self.buffered() == 0 {
            self.release();
        }
        result
    }

    /// Runs the decode loop over whatever remains, then releases the buffer.
    /// Called once when the connection goes inactive
    pub fn decode_last<C: Codec + ?Sized>(
        &mut self,
        codec: &C,
        connection: &Connection,
        out: &mut Vec<Message>,
    ) -> Result<(), RpcError> {
        let mut result = Ok(());
        while self.buffered() > 0 {
            let before = out.len();
            result = self.call_decode(codec, connection, out);
            if result.is_err() || out.len() == before {
                break;
            }
        }

        let leftover = self.buffered();
        if leftover > 0 {
            log::trace!(target: "strand", "Dropping {leftover} trailing bytes of an incomplete frame on {connection:?}");
        }

        self.release();
        result
    }

    fn call_decode<C: Codec + ?Sized>(
        &mut self,
        codec: &C,
        connection: &Connection,
        out: &mut Vec<Message>,
    ) -> Result<(), RpcError> {
        loop {
            let step = match self.cumulation.as_ref() {
                Some(cumulation) if !cumulation.is_empty() => {
                    let before = cumulation.len();
                    let mut view = cumulation.view();
                    let result = codec.decode(connection, &mut view);
                    let consumed = before - view.remaining();
                    match result {
                        Ok(DecodeResult::Message(message)) => Ok(Step::Emit(message, consumed)),
                        Ok(DecodeResult::Skipped) => Ok(Step::Skip(consumed)),
                        Ok(DecodeResult::NotEnoughData) => Ok(Step::Stop),
                        Err(err) => Err(err),
                    }
                }
                _ => Ok(Step::Stop),
            };

            match step {
                Err(err) => {
                    self.release();
                    return Err(err);
                }

                Ok(Step::Stop) => return Ok(()),

                Ok(Step::Skip(0)) => return Ok(()),

                Ok(Step::Skip(consumed)) => self.consume(consumed),

                Ok(Step::Emit(_, 0)) => {
                    self.release();
                    return Err(RpcError::Decode(
                        "codec produced a message without consuming bytes".into(),
                    ));
                }

                Ok(Step::Emit(message, consumed)) => {
                    self.consume(consumed);
                    out.push(message);
                    if self.single_decode {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn consume(&mut self, cnt: usize) {
        if let Some(cumulation) = self.cumulation.as_mut() {
            cumulation.advance(cnt)
        }
    }

    fn finish_read(&mut self) {
        match self.cumulation.as_mut() {
            Some(cumulation) if cumulation.is_empty() => self.release(),
            Some(cumulation) => {
                self.num_reads += 1;
                if self.num_reads >= self.discard_after_reads {
                    self.num_reads = 0;
                    cumulation.compact();
                }
            }
            None => self.num_reads = 0,
        }
    }

    fn release(&mut self) {
        self.cumulation = None;
        self.num_reads = 0;
    }
}
