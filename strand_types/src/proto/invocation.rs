use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};

/// How the caller wants the result of a call shaped
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InvokeMode {
    Sync,
    Async,
    ClientStream,
    ServerStream,
    DuplexStream,
}

impl InvokeMode {
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Self::ClientStream | Self::ServerStream | Self::DuplexStream
        )
    }

    /// Whether the caller pushes more than one request frame
    pub fn streams_requests(&self) -> bool {
        matches!(self, Self::ClientStream | Self::DuplexStream)
    }

    /// Whether the peer answers with more than one response frame
    pub fn streams_responses(&self) -> bool {
        matches!(self, Self::ServerStream | Self::DuplexStream)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Sync => 0,
            Self::Async => 1,
            Self::ClientStream => 2,
            Self::ServerStream => 3,
            Self::DuplexStream => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Sync,
            1 => Self::Async,
            2 => Self::ClientStream,
            3 => Self::ServerStream,
            4 => Self::DuplexStream,
            _ => return None,
        })
    }
}

/// The shape of a method as declared by the service definition
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub client_streaming: bool,
    pub server_streaming: bool,
    pub returns_future: bool,
}

impl MethodSignature {
    pub fn unary() -> Self {
        Self::default()
    }

    pub fn future() -> Self {
        Self {
            returns_future: true,
            ..Default::default()
        }
    }

    pub fn invoke_mode(&self) -> InvokeMode {
        match (self.client_streaming, self.server_streaming) {
            (true, true) => InvokeMode::DuplexStream,
            (true, false) => InvokeMode::ClientStream,
            (false, true) => InvokeMode::ServerStream,
            (false, false) if self.returns_future => InvokeMode::Async,
            (false, false) => InvokeMode::Sync,
        }
    }
}

impl From<InvokeMode> for MethodSignature {
    fn from(mode: InvokeMode) -> Self {
        match mode {
            InvokeMode::Sync => Self::unary(),
            InvokeMode::Async => Self::future(),
            InvokeMode::ClientStream => Self {
                client_streaming: true,
                ..Default::default()
            },
            InvokeMode::ServerStream => Self {
                server_streaming: true,
                ..Default::default()
            },
            InvokeMode::DuplexStream => Self {
                client_streaming: true,
                server_streaming: true,
                returns_future: false,
            },
        }
    }
}

/// Method metadata. The [`InvokeMode`] is derived from the signature exactly
/// once, at construction; share descriptors through [`MethodCache`] or an
/// `Arc` rather than rebuilding them per call.
#[derive(Clone, Eq, PartialEq)]
pub struct MethodDescriptor {
    path: String,
    signature: MethodSignature,
    mode: InvokeMode,
}

impl MethodDescriptor {
    /// `path` is the fully-qualified `/service/method` name
    pub fn new<T: Into<String>>(path: T, signature: MethodSignature) -> Self {
        Self {
            path: path.into(),
            signature,
            mode: signature.invoke_mode(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn signature(&self) -> MethodSignature {
        self.signature
    }

    pub fn invoke_mode(&self) -> InvokeMode {
        self.mode
    }
}

impl Debug for MethodDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.mode)
    }
}

/// Interns method descriptors by path and invoke mode so decoded requests for
/// the same method share one descriptor.
#[derive(Default)]
pub struct MethodCache {
    methods: RwLock<HashMap<(String, InvokeMode), Arc<MethodDescriptor>>>,
}

impl MethodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&self, path: &str, mode: InvokeMode) -> Arc<MethodDescriptor> {
        if let Some(method) = self.methods.read().get(&(path.to_string(), mode)) {
            return method.clone();
        }

        self.methods
            .write()
            .entry((path.to_string(), mode))
            .or_insert_with(|| Arc::new(MethodDescriptor::new(path, mode.into())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }
}

/// Timeout budget for a call that participates in full-chain (link) timeout
/// tracking. `remaining` only ever shrinks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LeftTimeout {
    original: Duration,
    remaining: Duration,
}

impl LeftTimeout {
    pub fn new(original: Duration) -> Self {
        Self {
            original,
            remaining: original,
        }
    }

    /// Rebuilds a budget received from an upstream hop. `remaining` is clamped
    /// to `original`
    pub fn with_remaining(original: Duration, remaining: Duration) -> Self {
        Self {
            original,
            remaining: remaining.min(original),
        }
    }

    pub fn original(&self) -> Duration {
        self.original
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Deducts elapsed (or backup-delay) time from the budget
    pub fn subtract(&mut self, elapsed: Duration) {
        self.remaining = self.remaining.saturating_sub(elapsed);
    }

    pub fn is_expired(&self) -> bool {
        self.remaining.is_zero()
    }
}

/// Per-call invocation data: which method, how long to wait, and whether this
/// call is part of an upstream link-timeout budget
#[derive(Clone, Debug)]
pub struct InvocationDescriptor {
    pub method: Arc<MethodDescriptor>,
    pub timeout: Duration,
    /// When set, a backup request is issued after this delay without a response
    pub backup_request_time: Option<Duration>,
    /// When set, link-timeout tracking was enabled by an upstream hop
    pub link_timeout: Option<LeftTimeout>,
}

impl InvocationDescriptor {
    pub fn new(method: Arc<MethodDescriptor>, timeout: Duration) -> Self {
        Self {
            method,
            timeout,
            backup_request_time: None,
            link_timeout: None,
        }
    }

    pub fn with_backup_request_time(mut self, delay: Duration) -> Self {
        self.backup_request_time = Some(delay);
        self
    }

    pub fn with_link_timeout(mut self, budget: LeftTimeout) -> Self {
        self.link_timeout = Some(budget);
        self
    }

    pub fn invoke_mode(&self) -> InvokeMode {
        self.method.invoke_mode()
    }

    pub fn is_link_timeout_enabled(&self) -> bool {
        self.link_timeout.is_some()
    }

    /// The wait applied to this hop: the call timeout, capped by whatever is
    /// left of the link budget
    pub fn effective_timeout(&self) -> Duration {
        match self.link_timeout {
            Some(budget) => self.timeout.min(budget.remaining()),
            None => self.timeout,
        }
    }
}
