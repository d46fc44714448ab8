//! Length-Prefixed Reference Codec
//!
//! A compact self-delimiting binary encoding of [`Message`], used to run the
//! engine end to end over TCP and UDP. Business payloads stay opaque bytes.
//!
//! # Frame layout (big endian)
//!
//! ```text
//! u32 length of everything below
//! u8  kind            0 = request, 1 = response, 2 = heartbeat
//! u32 request id
//! u8  flags           end-of-stream | error | link-timeout | continuation
//! request:   u16 path length, path, u8 invoke mode, u32 timeout ms,
//!            [u32 link original ms, u32 link remaining ms]
//! response:  [i32 error code]
//! u16 attachment count, per attachment:
//!            u16 key length, key, u8 value kind, u32 value length, value
//! payload    the rest of the frame (error message for failed responses)
//! ```
//!
//! # Important Notes
//! - Frames above `max_frame_size` are rejected on both encode and decode
//! - Heartbeat frames decode as [`DecodeResult::Skipped`]
//! - Method descriptors are interned through a [`MethodCache`]

use crate::constants::{
    ATTACHMENT_KIND_BYTES, ATTACHMENT_KIND_STR, FLAG_END_OF_STREAM, FLAG_ERROR,
    FLAG_CONTINUATION, FLAG_LINK_TIMEOUT, FRAME_KIND_HEARTBEAT, FRAME_KIND_REQUEST, FRAME_KIND_RESPONSE,
    FRAME_LENGTH_FIELD_LEN,
};
use crate::error::RpcError;
use crate::proto::codec::{Codec, DecodeResult};
use crate::proto::connection::Connection;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use strand_types::config::DEFAULT_MAX_FRAME_SIZE;
use strand_types::errors::RemoteError;
use strand_types::proto::{
    AttachmentValue, Attachments, InvocationDescriptor, InvokeMode, LeftTimeout, MethodCache,
    Message, Request, Response,
};

pub struct LengthPrefixedCodec {
    max_frame_size: usize,
    methods: MethodCache,
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl LengthPrefixedCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            methods: MethodCache::new(),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Appends a heartbeat frame, which peers consume without producing a
    /// message
    pub fn encode_heartbeat(buf: &mut BytesMut) {
        buf.put_u32(1);
        buf.put_u8(FRAME_KIND_HEARTBEAT);
    }

    fn encode_request(buf: &mut BytesMut, request: &Request) -> Result<(), RpcError> {
        let mut flags = 0;
        if request.end_of_stream {
            flags |= FLAG_END_OF_STREAM;
        }
        if request.invocation.link_timeout.is_some() {
            flags |= FLAG_LINK_TIMEOUT;
        }
        if request.continuation {
            flags |= FLAG_CONTINUATION;
        }

        buf.put_u8(FRAME_KIND_REQUEST);
        buf.put_u32(request.request_id);
        buf.put_u8(flags);

        let path = request.invocation.method.path().as_bytes();
        let path_len = u16::try_from(path.len())
            .map_err(|_| RpcError::Encode(format!("method path of {} bytes", path.len())))?;
        buf.put_u16(path_len);
        buf.put_slice(path);
        buf.put_u8(request.invocation.invoke_mode().as_u8());
        buf.put_u32(millis_u32(request.invocation.timeout));

        if let Some(budget) = request.invocation.link_timeout {
            buf.put_u32(millis_u32(budget.original()));
            buf.put_u32(millis_u32(budget.remaining()));
        }

        encode_attachments(buf, &request.attachments)?;
        buf.put_slice(&request.payload);
        Ok(())
    }

    fn encode_response(buf: &mut BytesMut, response: &Response) -> Result<(), RpcError> {
        let mut flags = 0;
        if response.end_of_stream {
            flags |= FLAG_END_OF_STREAM;
        }
        if response.result.is_err() {
            flags |= FLAG_ERROR;
        }

        buf.put_u8(FRAME_KIND_RESPONSE);
        buf.put_u32(response.request_id);
        buf.put_u8(flags);

        if let Err(err) = &response.result {
            buf.put_i32(err.code);
        }

        encode_attachments(buf, &response.attachments)?;

        match &response.result {
            Ok(value) => buf.put_slice(value),
            Err(err) => buf.put_slice(err.message.as_bytes()),
        }

        Ok(())
    }

    fn decode_frame(&self, mut frame: Bytes) -> Result<DecodeResult<Message>, RpcError> {
        require(&frame, 1, "frame kind")?;
        let kind = frame.get_u8();
        if kind == FRAME_KIND_HEARTBEAT {
            return Ok(DecodeResult::Skipped);
        }

        require(&frame, 5, "frame header")?;
        let request_id = frame.get_u32();
        let flags = frame.get_u8();
        let end_of_stream = flags & FLAG_END_OF_STREAM != 0;

        match kind {
            FRAME_KIND_REQUEST => {
                require(&frame, 2, "method path length")?;
                let path_len = frame.get_u16() as usize;
                require(&frame, path_len + 5, "method path")?;
                let path = frame.split_to(path_len);
                let path = std::str::from_utf8(&path)
                    .map_err(|_| RpcError::Decode("method path is not utf-8".into()))?;
                let mode = InvokeMode::from_u8(frame.get_u8())
                    .ok_or_else(|| RpcError::Decode("unknown invoke mode".into()))?;
                let timeout = Duration::from_millis(frame.get_u32() as u64);

                let method = self.methods.get_or_insert(path, mode);
                let mut invocation = InvocationDescriptor::new(method, timeout);
                if flags & FLAG_LINK_TIMEOUT != 0 {
                    require(&frame, 8, "link timeout")?;
                    let original = Duration::from_millis(frame.get_u32() as u64);
                    let remaining = Duration::from_millis(frame.get_u32() as u64);
                    invocation = invocation
                        .with_link_timeout(LeftTimeout::with_remaining(original, remaining));
                }

                let attachments = decode_attachments(&mut frame)?;
                let mut request = Request::new(request_id, invocation, frame);
                request.attachments = attachments;
                request.end_of_stream = end_of_stream;
                request.continuation = flags & FLAG_CONTINUATION != 0;
                Ok(DecodeResult::Message(Message::Request(request)))
            }

            FRAME_KIND_RESPONSE => {
                let code = if flags & FLAG_ERROR != 0 {
                    require(&frame, 4, "error code")?;
                    Some(frame.get_i32())
                } else {
                    None
                };

                let attachments = decode_attachments(&mut frame)?;
                let result = match code {
                    Some(code) => Err(RemoteError::new(
                        code,
                        String::from_utf8_lossy(&frame).into_owned(),
                    )),
                    None => Ok(frame),
                };

                let mut response = Response::new(request_id, result).with_end_of_stream(end_of_stream);
                response.attachments = attachments;
                Ok(DecodeResult::Message(Message::Response(response)))
            }

            kind => Err(RpcError::Decode(format!("unknown frame kind {kind}"))),
        }
    }
}

impl Codec for LengthPrefixedCodec {
    fn encode(
        &self,
        _connection: &Connection,
        buf: &mut BytesMut,
        message: &Message,
    ) -> Result<(), RpcError> {
        let start = buf.len();
        buf.put_u32(0);

        match message {
            Message::Request(request) => Self::encode_request(buf, request)?,
            Message::Response(response) => Self::encode_response(buf, response)?,
        }

        let len = buf.len() - start - FRAME_LENGTH_FIELD_LEN;
        if len > self.max_frame_size {
            return Err(RpcError::Encode(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_frame_size
            )));
        }

        buf[start..start + FRAME_LENGTH_FIELD_LEN].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }

    fn decode(
        &self,
        _connection: &Connection,
        buf: &mut dyn Buf,
    ) -> Result<DecodeResult<Message>, RpcError> {
        if buf.remaining() < FRAME_LENGTH_FIELD_LEN {
            return Ok(DecodeResult::NotEnoughData);
        }

        let len = buf.get_u32() as usize;
        if len > self.max_frame_size {
            return Err(RpcError::Decode(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_frame_size
            )));
        }

        if buf.remaining() < len {
            return Ok(DecodeResult::NotEnoughData);
        }

        let frame = buf.copy_to_bytes(len);
        self.decode_frame(frame)
    }
}

fn require(frame: &Bytes, len: usize, what: &str) -> Result<(), RpcError> {
    if frame.remaining() < len {
        Err(RpcError::Decode(format!("truncated frame: missing {what}")))
    } else {
        Ok(())
    }
}

fn millis_u32(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn encode_attachments(buf: &mut BytesMut, attachments: &Attachments) -> Result<(), RpcError> {
    let count = u16::try_from(attachments.len())
        .map_err(|_| RpcError::Encode(format!("{} attachments", attachments.len())))?;
    buf.put_u16(count);

    for (key, value) in attachments.iter() {
        let key_len = u16::try_from(key.len())
            .map_err(|_| RpcError::Encode(format!("attachment key of {} bytes", key.len())))?;
        let (kind, bytes) = match value {
            AttachmentValue::Str(value) => (ATTACHMENT_KIND_STR, value.as_bytes()),
            AttachmentValue::Bytes(value) => (ATTACHMENT_KIND_BYTES, value.as_ref()),
        };
        let value_len = u32::try_from(bytes.len())
            .map_err(|_| RpcError::Encode(format!("attachment value of {} bytes", bytes.len())))?;

        buf.put_u16(key_len);
        buf.put_slice(key.as_bytes());
        buf.put_u8(kind);
        buf.put_u32(value_len);
        buf.put_slice(bytes);
    }

    Ok(())
}

fn decode_attachments(frame: &mut Bytes) -> Result<Attachments, RpcError> {
    require(frame, 2, "attachment count")?;
    let count = frame.get_u16();
    let mut attachments = Attachments::new();

    for _ in 0..count {
        require(frame, 2, "attachment key length")?;
        let key_len = frame.get_u16() as usize;
        require(frame, key_len + 5, "attachment key")?;
        let key = String::from_utf8(frame.split_to(key_len).to_vec())
            .map_err(|_| RpcError::Decode("attachment key is not utf-8".into()))?;
        let kind = frame.get_u8();
        let value_len = frame.get_u32() as usize;
        require(frame, value_len, "attachment value")?;
        let value = frame.split_to(value_len);

        let value = match kind {
            ATTACHMENT_KIND_STR => AttachmentValue::Str(
                String::from_utf8(value.to_vec())
                    .map_err(|_| RpcError::Decode("attachment value is not utf-8".into()))?,
            ),
            ATTACHMENT_KIND_BYTES => AttachmentValue::Bytes(value),
            kind => {
                return Err(RpcError::Decode(format!("unknown attachment kind {kind}")));
            }
        };

        let _ = attachments.insert(key, value);
    }

    Ok(attachments)
}
