//! Socket Creation and Configuration Utilities
//!
//! Builds the raw sockets the transports run on, applying the subset of the
//! protocol configuration that has to be set before `bind`/`connect`:
//! address and port reuse, kernel buffer sizes and the listen backlog.
//!
//! # Features
//!
//! - TCP listeners and UDP sockets with optional SO_REUSEPORT so the same
//!   address can be bound once per acceptor
//! - TCP connects bounded by a timeout
//! - IPv4 and IPv6 (dual-stack where the platform allows)
//!
//! # Important Notes
//!
//! - Every function that returns a tokio socket must be called from within a
//!   runtime context (the transport enters its I/O group first)
//! - Port reuse is silently unavailable on platforms without SO_REUSEPORT;
//!   check [`is_reuse_port_supported`] before relying on multi-bind

use socket2::{Domain, SockAddr, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use strand_io::tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Pre-bind socket tuning
#[derive(Copy, Clone, Debug)]
pub struct SocketOptions {
    pub reuse_port: bool,
    pub backlog: u32,
    pub receive_buffer: Option<usize>,
    pub send_buffer: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_port: false,
            backlog: 1024,
            receive_buffer: None,
            send_buffer: None,
        }
    }
}

impl SocketOptions {
    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }
}

/// Whether this platform lets several sockets bind the same address and have
/// the kernel balance incoming connections across them
pub const fn is_reuse_port_supported() -> bool {
    cfg!(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn resolve<T: ToSocketAddrs>(addr: T) -> Result<SocketAddr, anyhow::Error> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::Error::msg("Bad socket addr"))
}

fn setup_base_socket(
    addr: SocketAddr,
    socket: &Socket,
    options: &SocketOptions,
) -> Result<(), anyhow::Error> {
    if options.reuse_port {
        socket.set_reuse_address(true)?;

        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        {
            socket.set_reuse_port(true)?;
        }
    }

    if let Some(size) = options.receive_buffer {
        socket.set_recv_buffer_size(size)?;
    }

    if let Some(size) = options.send_buffer {
        socket.set_send_buffer_size(size)?;
    }

    socket.set_nonblocking(true)?;

    if !cfg!(windows) && addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    Ok(())
}

fn setup_bind(
    addr: SocketAddr,
    socket: &Socket,
    options: &SocketOptions,
) -> Result<(), anyhow::Error> {
    setup_base_socket(addr, socket, options)?;
    socket.bind(&SockAddr::from(addr))?;
    Ok(())
}

/// Binds and listens on `addr`
pub fn get_tcp_listener<T: ToSocketAddrs>(
    addr: T,
    options: &SocketOptions,
) -> Result<TcpListener, anyhow::Error> {
    let addr = resolve(addr)?;
    log::trace!(target: "strand", "[Socket helper] Getting TCP listener (reuse={}) socket @ {:?} ...", options.reuse_port, &addr);
    let socket = Socket::new(domain_for(&addr), Type::STREAM, None)?;
    setup_bind(addr, &socket, options)?;
    socket.listen(options.backlog.min(i32::MAX as u32) as i32)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Binds a datagram socket on `addr`
pub fn get_udp_socket<T: ToSocketAddrs>(
    addr: T,
    options: &SocketOptions,
) -> Result<UdpSocket, anyhow::Error> {
    let addr = resolve(addr)?;
    log::trace!(target: "strand", "[Socket helper] Getting UDP (reuse={}) socket @ {:?} ...", options.reuse_port, &addr);
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, None)?;
    setup_bind(addr, &socket, options)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Connects to `addr`, failing once `timeout` elapses
pub async fn get_tcp_stream<T: ToSocketAddrs>(
    addr: T,
    timeout: Duration,
    options: &SocketOptions,
) -> Result<TcpStream, anyhow::Error> {
    let addr = resolve(addr)?;
    log::trace!(target: "strand", "[Socket helper] Getting TCP connect socket to {:?} ...", &addr);
    let socket = Socket::new(domain_for(&addr), Type::STREAM, None)?;
    // port reuse is a listener concern; never share outbound ephemeral ports
    setup_base_socket(addr, &socket, &options.with_reuse_port(false))?;
    let socket = strand_io::tokio::net::TcpSocket::from_std_stream(socket.into());
    let stream = strand_io::tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| anyhow::Error::msg(format!("connect to {addr} timed out after {timeout:?}")))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub fn is_ipv6_enabled() -> bool {
    // this is a bit hacky, but, should prevent pipelines from failing
    // if runners don't have ipv6 compat
    if let Ok(sck) = std::net::TcpListener::bind("[::]:0") {
        sck.local_addr().map(|r| r.is_ipv6()).unwrap_or(false)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::socket_helpers::{
        get_tcp_listener, get_tcp_stream, get_udp_socket, is_ipv6_enabled,
        is_reuse_port_supported, SocketOptions,
    };
    use rstest::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use strand_io::tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TIMEOUT: Duration = Duration::from_millis(2000);

    #[rstest]
    #[case("127.0.0.1:0")]
    #[case("[::1]:0")]
    #[trace]
    #[tokio::test]
    async fn test_tcp(#[case] addr: SocketAddr) -> std::io::Result<()> {
        strand_logging::setup_log();
        if addr.is_ipv6() && !is_ipv6_enabled() {
            log::trace!(target: "strand", "Skipping IPv6 test since IPv6 is not enabled");
            return Ok(());
        }
        let options = SocketOptions::default();
        let server = get_tcp_listener(addr, &options).unwrap();
        let addr = server.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = server.accept().await.unwrap();
            let buf = &mut [0u8; 3];
            conn.read_exact(buf as &mut [u8]).await.unwrap();
            assert_eq!(buf, &[1, 2, 3]);
        });

        let client = tokio::spawn(async move {
            let mut client = get_tcp_stream(addr, TIMEOUT, &options).await.unwrap();
            client.write_all(&[1, 2, 3]).await.unwrap();
        });

        let (r0, r1) = tokio::join!(server, client);
        Ok(r0.and(r1)?)
    }

    #[rstest]
    #[case("127.0.0.1:0")]
    #[case("[::1]:0")]
    #[tokio::test]
    async fn test_udp(#[case] addr: SocketAddr) -> Result<(), anyhow::Error> {
        strand_logging::setup_log();
        if addr.is_ipv6() && !is_ipv6_enabled() {
            return Ok(());
        }
        let options = SocketOptions::default();
        let server = get_udp_socket(addr, &options)?;
        let addr = server.local_addr()?;
        let client_bind_addr = if addr.is_ipv6() {
            "[::1]:0"
        } else {
            "127.0.0.1:0"
        };
        let client = get_udp_socket(client_bind_addr, &options)?;
        client.send_to(&[1, 2, 3], addr).await?;

        let buf = &mut [0u8; 3];
        let (len, from) = server.recv_from(buf as &mut [u8]).await?;
        assert_eq!(len, 3);
        assert_eq!(buf, &[1, 2, 3]);
        assert_eq!(from, client.local_addr()?);
        Ok(())
    }

    #[tokio::test]
    async fn reuse_port_allows_multi_bind() -> Result<(), anyhow::Error> {
        if !is_reuse_port_supported() {
            return Ok(());
        }
        let options = SocketOptions::default().with_reuse_port(true);
        let first = get_tcp_listener("127.0.0.1:0", &options)?;
        let addr = first.local_addr()?;
        let second = get_tcp_listener(addr, &options)?;
        assert_eq!(second.local_addr()?, addr);
        Ok(())
    }

    #[tokio::test]
    async fn bind_conflict_without_reuse_fails() -> Result<(), anyhow::Error> {
        let options = SocketOptions::default();
        let first = get_tcp_listener("127.0.0.1:0", &options)?;
        let addr = first.local_addr()?;
        assert!(get_tcp_listener(addr, &options).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        let options = SocketOptions::default();
        // bind then drop to find a port nobody listens on
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        assert!(get_tcp_stream(addr, TIMEOUT, &options).await.is_err());
    }
}
