//! Connection-level building blocks: the codec contract and its adapters,
//! inbound framing, and the connection handle with its registry.

pub mod adapter;
pub mod codec;
pub mod connection;
pub mod cumulation;
pub mod framing;
pub mod handler;
pub mod registry;
pub mod wire_codec;
