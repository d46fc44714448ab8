use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

/// The default error type for this crate
#[derive(Debug)]
pub enum Error {
    /// A configuration value failed validation
    InvalidConfig(String),
    /// For generic error types
    Generic(&'static str),
    /// For message types requiring heap
    Other(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(err) => write!(f, "invalid protocol config: {err}"),
            Self::Generic(err) => write!(f, "{err}"),
            Self::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {}

/// The exception half of a [`crate::proto::Response`]. Produced by the remote
/// business layer and carried back verbatim; the transport never inspects it.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
}

impl RemoteError {
    /// The server could not route the request to a service
    pub const NOT_FOUND: i32 = 404;
    /// The business handler failed
    pub const INTERNAL: i32 = 500;
    /// The server ran out of its share of the link timeout budget
    pub const TIMEOUT: i32 = 504;

    pub fn new<T: Into<String>>(code: i32, message: T) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::new(Self::INTERNAL, message)
    }
}

impl Debug for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteError[{}]: {}", self.code, self.message)
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for RemoteError {}
