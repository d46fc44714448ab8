//! Call-scoped value objects exchanged between the invocation layer and the
//! transport.
//!
//! A [`Request`] travels from the caller through the client transport onto the
//! wire; the peer answers with a [`Response`] carrying the same request id.
//! Both are plain values: nothing here is reused across calls except the
//! explicit backup-request clone produced by [`Request::clone_for_backup`].

mod attachments;
mod invocation;
mod message;
mod request_id;

pub use attachments::{AttachmentValue, Attachments};
pub use invocation::{
    InvocationDescriptor, InvokeMode, LeftTimeout, MethodCache, MethodDescriptor, MethodSignature,
};
pub use message::{Message, Request, Response};
pub use request_id::{RequestIdGenerator, REQUEST_ID_SPACE};
