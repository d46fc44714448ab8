use crate::errors::RemoteError;
use crate::proto::{Attachments, InvocationDescriptor};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// An outbound or inbound call
#[derive(Clone, Debug)]
pub struct Request {
    pub request_id: u32,
    /// Client side: the destination. Server side: stamped with the sender
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub attachments: Attachments,
    pub invocation: InvocationDescriptor,
    pub payload: Bytes,
    /// Request frames of a client or duplex stream share one id; the final
    /// frame carries this flag. Unary requests always carry it
    pub end_of_stream: bool,
    /// Set on every request frame after the opening one of a stream
    pub continuation: bool,
}

impl Request {
    pub fn new<T: Into<Bytes>>(request_id: u32, invocation: InvocationDescriptor, payload: T) -> Self {
        Self {
            request_id,
            remote_addr: None,
            local_addr: None,
            attachments: Attachments::new(),
            invocation,
            payload: payload.into(),
            end_of_stream: true,
            continuation: false,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Identical copy under a fresh id, used by the backup-request race
    pub fn clone_for_backup(&self, request_id: u32) -> Self {
        let mut backup = self.clone();
        backup.request_id = request_id;
        backup
    }

    /// Another frame of the same streaming call
    pub fn stream_frame<T: Into<Bytes>>(&self, payload: T, end_of_stream: bool) -> Self {
        Self {
            request_id: self.request_id,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            attachments: Attachments::new(),
            invocation: self.invocation.clone(),
            payload: payload.into(),
            end_of_stream,
            continuation: true,
        }
    }
}

/// The answer to a [`Request`]. Holds either a value or a remote exception,
/// never both
#[derive(Clone, Debug)]
pub struct Response {
    pub request_id: u32,
    pub result: Result<Bytes, RemoteError>,
    pub attachments: Attachments,
    /// Terminates a server or duplex stream. Unary responses always carry it
    pub end_of_stream: bool,
    /// The originating request. Present on the server side, where it supplies
    /// the destination of datagram replies
    pub request: Option<Arc<Request>>,
}

impl Response {
    pub fn new(request_id: u32, result: Result<Bytes, RemoteError>) -> Self {
        Self {
            request_id,
            result,
            attachments: Attachments::new(),
            end_of_stream: true,
            request: None,
        }
    }

    /// A successful reply to `request`
    pub fn success<T: Into<Bytes>>(request: Arc<Request>, value: T) -> Self {
        Self::reply(request, Ok(value.into()))
    }

    /// A failed reply to `request`
    pub fn failure(request: Arc<Request>, error: RemoteError) -> Self {
        Self::reply(request, Err(error))
    }

    fn reply(request: Arc<Request>, result: Result<Bytes, RemoteError>) -> Self {
        Self {
            request_id: request.request_id,
            result,
            attachments: Attachments::new(),
            end_of_stream: true,
            request: Some(request),
        }
    }

    pub fn with_end_of_stream(mut self, end_of_stream: bool) -> Self {
        self.end_of_stream = end_of_stream;
        self
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.result.as_ref().ok()
    }

    pub fn exception(&self) -> Option<&RemoteError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<Bytes, RemoteError> {
        self.result
    }
}

/// The unit a codec encodes and decodes
#[derive(Clone, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn request_id(&self) -> u32 {
        match self {
            Self::Request(request) => request.request_id,
            Self::Response(response) => response.request_id,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(..))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(request) => Some(request),
            Self::Response(..) => None,
        }
    }

    pub fn as_request_mut(&mut self) -> Option<&mut Request> {
        match self {
            Self::Request(request) => Some(request),
            Self::Response(..) => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(response) => Some(response),
            Self::Request(..) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}
