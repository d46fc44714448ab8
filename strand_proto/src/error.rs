use std::error::Error;
use std::fmt::Formatter;
use std::fmt::{Debug, Display};
use strand_io::tokio::sync::mpsc::error::SendError;
use strand_types::errors::RemoteError;

/// The basic error type for this crate
#[derive(Clone, Eq, PartialEq)]
pub enum RpcError {
    /// A listening socket could not be bound. Fatal to startup, never retried
    Bind(String),
    /// The inbound byte stream could not be decoded. The unread bytes are
    /// discarded and the connection is closed
    Decode(String),
    /// A message could not be encoded. Fails only the affected send
    Encode(String),
    /// No response arrived within the call timeout
    CallTimeout { timeout_ms: u64 },
    /// No response arrived within the link (full-chain) timeout budget
    LinkTimeout { timeout_ms: u64 },
    /// Establishing a connection failed
    Connect(String),
    /// The connection dropped before the operation completed
    ConnectionClosed,
    /// The peer answered with an exception
    Remote(RemoteError),
    InvalidConfig(String),
    /// The operation was abandoned by its caller
    Cancelled,
    /// For a converted error
    Generic(String),
}

impl Error for RpcError {}

impl Debug for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_msg())
    }
}

impl RpcError {
    fn to_msg(&self) -> String {
        match self {
            RpcError::Bind(err) => format!("Bind failed: {err}"),
            RpcError::Decode(err) => format!("Decode failed: {err}"),
            RpcError::Encode(err) => format!("Encode failed: {err}"),
            RpcError::CallTimeout { timeout_ms } => {
                format!("Call timed out after {timeout_ms}ms")
            }
            RpcError::LinkTimeout { timeout_ms } => {
                format!("Link timeout budget of {timeout_ms}ms exhausted")
            }
            RpcError::Connect(err) => format!("Connect failed: {err}"),
            RpcError::ConnectionClosed => "Connection closed".to_string(),
            RpcError::Remote(err) => format!("{err:?}"),
            RpcError::InvalidConfig(err) => format!("Invalid config: {err}"),
            RpcError::Cancelled => "Cancelled".to_string(),
            RpcError::Generic(err) => err.clone(),
        }
    }

    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Generic(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CallTimeout { .. } | Self::LinkTimeout { .. })
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <Self as Debug>::fmt(self, f)
    }
}

impl<T> From<SendError<T>> for RpcError {
    fn from(_: SendError<T>) -> Self {
        RpcError::ConnectionClosed
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote(err)
    }
}

impl From<strand_types::errors::Error> for RpcError {
    fn from(err: strand_types::errors::Error) -> Self {
        match err {
            strand_types::errors::Error::InvalidConfig(err) => RpcError::InvalidConfig(err),
            err => RpcError::Generic(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        RpcError::Generic(err.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Generic(err.to_string())
    }
}
