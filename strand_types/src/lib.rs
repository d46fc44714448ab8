pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::RemoteError;
    pub use crate::proto::*;
}

pub mod config;
pub mod errors;
pub mod proto;
