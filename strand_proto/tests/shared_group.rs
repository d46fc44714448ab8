mod common;

use common::{codec, private_config, NoopHandler, TestService};
use std::sync::Arc;
use strand_io::SharedIoGroupManager;
use strand_proto::prelude::*;

#[tokio::test]
async fn transports_share_one_group_until_the_last_leaves() {
    strand_logging::setup_log();
    let manager = SharedIoGroupManager::new("strand-test-shared", 2);
    let shared = |network| private_config(network).with_io_thread_group_share(true);

    let server = RpcServer::open_with_manager(
        shared(Network::Tcp),
        codec(),
        TestService::default(),
        manager.clone(),
    )
    .unwrap();
    let client = RpcClient::with_manager(
        shared(Network::Tcp).with_addr(server.local_addr()),
        codec(),
        manager.clone(),
    )
    .unwrap();

    assert_eq!(manager.ref_count(), 2);
    assert_eq!(manager.created_count(), 1);

    let request = client.new_request("/ping", InvokeMode::Async, "ping");
    assert_eq!(client.invoke_async(request).await.unwrap().as_ref(), b"pong");

    client.close().await;
    assert_eq!(manager.ref_count(), 1);
    assert!(manager.is_active());

    server.close().await;
    assert_eq!(manager.ref_count(), 0);
    assert!(!manager.is_active());
    assert_eq!(manager.created_count(), 1);
    assert_eq!(manager.destroyed_count(), 1);
}

#[tokio::test]
async fn a_new_group_is_built_after_teardown() {
    strand_logging::setup_log();
    let manager = SharedIoGroupManager::new("strand-test-rebuild", 1);
    let config = private_config(Network::Udp).with_io_thread_group_share(true);

    for round in 1..=2 {
        let server = RpcServer::open_with_manager(
            config.clone(),
            codec(),
            Arc::new(TestService::default()),
            manager.clone(),
        )
        .unwrap();
        assert_eq!(manager.ref_count(), 1);
        server.close().await;
        assert_eq!(manager.created_count(), round);
        assert_eq!(manager.destroyed_count(), round);
    }
}

#[tokio::test]
async fn closed_transports_cannot_reopen() {
    strand_logging::setup_log();
    let manager = SharedIoGroupManager::new("strand-test-reopen", 1);
    let transport = strand_proto::transport::TcpClientTransport::with_manager(
        private_config(Network::Tcp).with_io_thread_group_share(true),
        codec(),
        Arc::new(NoopHandler),
        manager.clone(),
    );

    transport.open().unwrap();
    transport.open().unwrap();
    assert_eq!(manager.ref_count(), 1);

    transport.close().await;
    assert_eq!(manager.ref_count(), 0);
    assert!(transport.open().is_err());
}
