//! Engine Constants
//!
//! Buffer sizes, thread-group names and wire limits shared by the transports
//! and the reference codec.
//!
//! # Important Notes
//! - All sizes are in bytes
//! - `MAX_DATAGRAM_SIZE` is the largest UDP payload over IPv4; larger frames
//!   must go over TCP

/// Bytes reserved ahead of every socket read
pub const READ_BUFFER_SIZE: usize = 8 * 1024;
/// The largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
/// Initial capacity of a connection's write buffer
pub const WRITE_BUFFER_SIZE: usize = 8 * 1024;
/// Backoff applied when `accept` fails, so that descriptor exhaustion does not
/// spin the acceptor
pub const ACCEPT_ERROR_BACKOFF_MS: u64 = 50;

pub const CLIENT_IO_GROUP_NAME: &str = "strand-client-io";
pub const SERVER_IO_GROUP_NAME: &str = "strand-server-io";
pub const ACCEPTOR_GROUP_NAME: &str = "strand-acceptor";

/// Frame kinds of the reference codec
pub const FRAME_KIND_REQUEST: u8 = 0;
pub const FRAME_KIND_RESPONSE: u8 = 1;
pub const FRAME_KIND_HEARTBEAT: u8 = 2;

pub const FLAG_END_OF_STREAM: u8 = 0b0000_0001;
pub const FLAG_ERROR: u8 = 0b0000_0010;
pub const FLAG_LINK_TIMEOUT: u8 = 0b0000_0100;
pub const FLAG_CONTINUATION: u8 = 0b0000_1000;

pub const ATTACHMENT_KIND_STR: u8 = 0;
pub const ATTACHMENT_KIND_BYTES: u8 = 1;

/// Length of the frame length prefix
pub const FRAME_LENGTH_FIELD_LEN: usize = 4;
