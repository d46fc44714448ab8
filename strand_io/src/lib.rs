//! Runtime plumbing shared by every Strand crate.
//!
//! Re-exports the async runtime so downstream crates pin a single tokio
//! version, aliases the `parking_lot` locks used for cross-connection state,
//! and owns the I/O thread groups that transports run their connections on.
#![forbid(unsafe_code)]

pub mod io_group;
pub mod standard;

pub use io_group::{IoGroup, IoGroupLease, IoThreadGroup, SharedIoGroupManager};
pub use standard::locks::*;
pub use standard::spawn::*;

#[cfg(feature = "deadlock-detection")]
pub use parking_lot::deadlock;

pub use parking_lot::{const_mutex, const_rwlock};

pub use tokio;
pub use tokio_stream;
pub use tokio_util;
