//! Call-side engine: pending completions, the result adapter that applies
//! timeouts, backup races and streaming, and the client tying both to a
//! transport.

pub mod client;
pub mod pending;
pub mod result_adapter;

pub use client::{CallOutcome, RpcClient};
pub use pending::{PendingCalls, PendingResponse, PendingStream};
pub use result_adapter::{RequestSink, ResponseStream, StreamCall};
