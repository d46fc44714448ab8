//! Protocol Configuration
//!
//! [`ProtocolConfig`] is the read-only value the transport and invocation
//! layers are built from. It is normally produced by an outer configuration
//! layer (and may be deserialized from any serde format using the camelCase
//! field names below); this crate only supplies defaults, builder-style
//! setters and validation.
//!
//! # Important Notes
//!
//! - Durations are expressed in milliseconds, matching the wire of the outer
//!   configuration layer
//! - An `idle_timeout` of zero disables idle disconnection
//! - `boss_threads` only matters for servers, and only multiplies listening
//!   sockets when `reuse_port` is enabled on a platform that supports it

use crate::errors::Error;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use strum::{Display, EnumString};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

/// How inbound chunks are accumulated before decoding
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CumulatorKind {
    /// Copy every chunk into one contiguous buffer
    #[default]
    Merge,
    /// Chain chunks as segments without copying
    Composite,
}

pub const DEFAULT_BACKLOG: u32 = 1024;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 180_000;
pub const DEFAULT_CONN_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_EXPLICIT_FLUSH_AFTER_FLUSHES: usize = 256;
pub const DEFAULT_DISCARD_AFTER_READS: usize = 16;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

fn default_io_threads() -> usize {
    (num_cpus::get() * 2).max(1)
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolConfig {
    pub ip: IpAddr,
    pub port: u16,
    pub network: Network,
    pub io_threads: usize,
    pub boss_threads: usize,
    pub receive_buffer: Option<usize>,
    pub send_buffer: Option<usize>,
    pub backlog: u32,
    pub idle_timeout: u64,
    pub conn_timeout: u64,
    pub keep_alive: bool,
    pub io_thread_group_share: bool,
    pub reuse_port: bool,
    pub batch_decoder: bool,
    pub flush_consolidation: bool,
    pub explicit_flush_after_flushes: usize,
    pub discard_after_reads: usize,
    pub cumulator: CumulatorKind,
    pub max_frame_size: usize,
    pub request_timeout: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            network: Network::Tcp,
            io_threads: default_io_threads(),
            boss_threads: 1,
            receive_buffer: None,
            send_buffer: None,
            backlog: DEFAULT_BACKLOG,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_MS,
            conn_timeout: DEFAULT_CONN_TIMEOUT_MS,
            keep_alive: true,
            io_thread_group_share: true,
            reuse_port: false,
            batch_decoder: true,
            flush_consolidation: false,
            explicit_flush_after_flushes: DEFAULT_EXPLICIT_FLUSH_AFTER_FLUSHES,
            discard_after_reads: DEFAULT_DISCARD_AFTER_READS,
            cumulator: CumulatorKind::Merge,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl ProtocolConfig {
    pub fn tcp() -> Self {
        Self::default()
    }

    pub fn udp() -> Self {
        Self {
            network: Network::Udp,
            ..Self::default()
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn idle_timeout_duration(&self) -> Option<Duration> {
        if self.idle_timeout == 0 {
            None
        } else {
            Some(Duration::from_millis(self.idle_timeout))
        }
    }

    pub fn conn_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.conn_timeout)
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.ip = addr.ip();
        self.port = addr.port();
        self
    }

    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    pub fn with_boss_threads(mut self, threads: usize) -> Self {
        self.boss_threads = threads;
        self
    }

    pub fn with_idle_timeout(mut self, millis: u64) -> Self {
        self.idle_timeout = millis;
        self
    }

    pub fn with_conn_timeout(mut self, millis: u64) -> Self {
        self.conn_timeout = millis;
        self
    }

    pub fn with_request_timeout(mut self, millis: u64) -> Self {
        self.request_timeout = millis;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_io_thread_group_share(mut self, share: bool) -> Self {
        self.io_thread_group_share = share;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_batch_decoder(mut self, batch: bool) -> Self {
        self.batch_decoder = batch;
        self
    }

    pub fn with_flush_consolidation(mut self, enabled: bool, explicit_flush_after: usize) -> Self {
        self.flush_consolidation = enabled;
        self.explicit_flush_after_flushes = explicit_flush_after;
        self
    }

    pub fn with_cumulator(mut self, cumulator: CumulatorKind) -> Self {
        self.cumulator = cumulator;
        self
    }

    pub fn with_buffers(mut self, receive: Option<usize>, send: Option<usize>) -> Self {
        self.receive_buffer = receive;
        self.send_buffer = send;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.io_threads == 0 {
            return Err(Error::InvalidConfig("ioThreads must be at least 1".into()));
        }

        if self.boss_threads == 0 {
            return Err(Error::InvalidConfig("bossThreads must be at least 1".into()));
        }

        if self.explicit_flush_after_flushes == 0 {
            return Err(Error::InvalidConfig(
                "explicitFlushAfterFlushes must be at least 1".into(),
            ));
        }

        if self.discard_after_reads == 0 {
            return Err(Error::InvalidConfig(
                "discardAfterReads must be at least 1".into(),
            ));
        }

        if self.max_frame_size == 0 {
            return Err(Error::InvalidConfig("maxFrameSize must be non-zero".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CumulatorKind, Network, ProtocolConfig};
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let config = ProtocolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network, Network::Tcp);
        assert!(config.keep_alive);
        assert!(config.batch_decoder);
        assert_eq!(config.idle_timeout_duration().unwrap().as_millis(), 180_000);
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let raw = r#"{
            "ip": "0.0.0.0",
            "port": 12000,
            "network": "udp",
            "ioThreads": 4,
            "bossThreads": 2,
            "idleTimeout": 0,
            "reusePort": true,
            "batchDecoder": false,
            "cumulator": "composite"
        }"#;
        let config: ProtocolConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.port, 12000);
        assert_eq!(config.network, Network::Udp);
        assert_eq!(config.io_threads, 4);
        assert_eq!(config.boss_threads, 2);
        assert!(config.idle_timeout_duration().is_none());
        assert!(config.reuse_port);
        assert!(!config.batch_decoder);
        assert_eq!(config.cumulator, CumulatorKind::Composite);
        // untouched fields keep their defaults
        assert_eq!(config.backlog, 1024);
        assert!(config.keep_alive);
    }

    #[rstest]
    #[case(ProtocolConfig::default().with_io_threads(0))]
    #[case(ProtocolConfig::default().with_boss_threads(0))]
    #[case(ProtocolConfig::default().with_flush_consolidation(true, 0))]
    fn rejects_invalid(#[case] config: ProtocolConfig) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn network_parses() {
        assert_eq!("udp".parse::<Network>().unwrap(), Network::Udp);
        assert_eq!(Network::Tcp.to_string(), "tcp");
    }
}
