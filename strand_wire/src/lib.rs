//! Socket construction for the Strand transports: TCP listeners with
//! configurable backlog, buffer sizes and kernel port sharing, UDP sockets,
//! and TCP connects bounded by a timeout.
#![forbid(unsafe_code)]

pub mod socket_helpers;

pub use socket_helpers::SocketOptions;
