mod common;

use bytes::Bytes;
use common::{codec, eventually, private_config, NoopHandler, TestService};
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;
use strand_io::tokio::io::AsyncReadExt;
use strand_io::tokio::net::TcpListener;
use strand_proto::prelude::*;
use strand_proto::transport::TcpClientTransport;

#[rstest]
#[case(Network::Tcp)]
#[case(Network::Udp)]
#[tokio::test]
async fn multi_bind_serves_on_every_socket(#[case] network: Network) {
    strand_logging::setup_log();
    let config = private_config(network)
        .with_reuse_port(true)
        .with_boss_threads(4);
    let server = RpcServer::open(config, codec(), TestService::default()).unwrap();

    let expected = if strand_wire::socket_helpers::is_reuse_port_supported() {
        4
    } else {
        1
    };
    assert_eq!(server.bound_sockets(), expected);

    // fresh clients hash across the bound sockets
    for _ in 0..8 {
        let client = RpcClient::new(private_config(network).with_addr(server.local_addr()), codec()).unwrap();
        let request = client.new_request("/ping", InvokeMode::Async, "ping");
        assert_eq!(client.invoke_async(request).await.unwrap().as_ref(), b"pong");
        client.close().await;
    }

    server.close().await;
}

#[tokio::test]
async fn unclaimed_connections_close_with_their_connect_future() {
    strand_logging::setup_log();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let transport = TcpClientTransport::new(
        private_config(Network::Tcp).with_addr(addr),
        codec(),
        Arc::new(NoopHandler),
    );
    transport.open().unwrap();

    let connecting = transport.connect(addr);
    let (mut accepted, _) = listener.accept().await.unwrap();
    assert!(eventually(|| transport.connections().len() == 1).await);

    drop(connecting);
    assert!(eventually(|| transport.connections().is_empty()).await);

    let mut buf = [0u8; 8];
    assert_eq!(accepted.read(&mut buf).await.unwrap(), 0);

    transport.close().await;
}

#[tokio::test]
async fn outbound_traffic_keeps_client_connections_alive() {
    strand_logging::setup_log();
    let server = RpcServer::open(private_config(Network::Tcp), codec(), TestService::default()).unwrap();
    let client = RpcClient::new(
        private_config(Network::Tcp)
            .with_addr(server.local_addr())
            .with_idle_timeout(300),
        codec(),
    )
    .unwrap();

    let connection = client
        .transport()
        .get_or_connect(server.local_addr())
        .await
        .unwrap();

    // one-way frames the server drops without answering
    for _ in 0..8 {
        let tick = Response::new(0, Ok(Bytes::from_static(b"tick")));
        connection.send(tick).await.unwrap();
        strand_io::tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(connection.is_connected());

    // silence in both directions
    assert!(eventually(|| !connection.is_connected()).await);

    client.close().await;
    server.close().await;
}
