mod common;

use common::{codec, eventually, private_config, TestService};
use futures::StreamExt;
use rstest::rstest;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use strand_proto::prelude::*;

fn serve(config: ProtocolConfig) -> (RpcServer, Arc<std::sync::atomic::AtomicUsize>) {
    let service = TestService::default();
    let calls = service.calls.clone();
    let server = RpcServer::open(config, codec(), service).unwrap();
    (server, calls)
}

fn client_for(server: &RpcServer, config: ProtocolConfig) -> RpcClient {
    RpcClient::new(config.with_addr(server.local_addr()), codec()).unwrap()
}

#[test]
fn sync_ping_pong_reuses_the_kept_alive_connection() {
    strand_logging::setup_log();
    let (server, calls) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp).with_keep_alive(true));

    let mut first = client.new_request("/ping", InvokeMode::Sync, "ping");
    first.request_id = 7;
    assert_eq!(client.invoke_sync(first).unwrap().as_ref(), b"pong");

    let connection = client.transport().connections();
    assert_eq!(connection.len(), 1);

    let second = client.new_request("/ping", InvokeMode::Sync, "ping");
    assert_eq!(client.invoke_sync(second).unwrap().as_ref(), b"pong");

    let reused = client.transport().connections();
    assert_eq!(reused.len(), 1);
    assert_eq!(reused[0].id(), connection[0].id());
    assert_eq!(server.channels().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(client.pending().is_empty());

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        client.close().await;
        server.close().await;
    });
}

#[rstest]
#[case(true, false, CumulatorKind::Merge)]
#[case(false, false, CumulatorKind::Composite)]
#[case(true, true, CumulatorKind::Composite)]
#[case(false, true, CumulatorKind::Merge)]
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_calls_over_one_connection(
    #[case] batch_decoder: bool,
    #[case] flush_consolidation: bool,
    #[case] cumulator: CumulatorKind,
) {
    strand_logging::setup_log();
    let tune = |config: ProtocolConfig| {
        config
            .with_batch_decoder(batch_decoder)
            .with_flush_consolidation(flush_consolidation, 8)
            .with_cumulator(cumulator)
    };

    let (server, _) = serve(tune(private_config(Network::Tcp)));
    let client = client_for(&server, tune(private_config(Network::Tcp)));

    let calls = (0..64).map(|i| {
        let request = client.new_request("/echo", InvokeMode::Async, format!("payload-{i}"));
        let client = &client;
        async move { (i, client.invoke_async(request).await) }
    });

    for (i, result) in futures::future::join_all(calls).await {
        assert_eq!(result.unwrap(), format!("payload-{i}").into_bytes());
    }

    // racing dials settle on the pooled connection
    assert!(eventually(|| client.transport().connections().len() == 1).await);
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn remote_errors_reach_the_caller() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp));

    let request = client.new_request("/missing", InvokeMode::Async, "");
    match client.invoke_async(request).await {
        Err(RpcError::Remote(err)) => assert_eq!(err.code, RemoteError::NOT_FOUND),
        other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn slow_calls_time_out() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp));

    let mut request = client.new_request("/slow", InvokeMode::Async, "");
    request.invocation.timeout = Duration::from_millis(100);
    assert_eq!(
        client.invoke_async(request).await,
        Err(RpcError::CallTimeout { timeout_ms: 100 })
    );
    assert!(client.pending().is_empty());

    let mut linked = client.new_request("/slow", InvokeMode::Async, "");
    linked.invocation.link_timeout = Some(LeftTimeout::with_remaining(
        Duration::from_millis(3_000),
        Duration::from_millis(100),
    ));
    assert_eq!(
        client.invoke_async(linked).await,
        Err(RpcError::LinkTimeout { timeout_ms: 3_000 })
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn backup_request_answers_a_stalled_call() {
    strand_logging::setup_log();
    let (server, calls) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp));

    let mut request = client.new_request("/first-is-slow", InvokeMode::Async, "");
    let primary_id = request.request_id;
    request.invocation.timeout = Duration::from_millis(1_000);
    request.invocation.backup_request_time = Some(Duration::from_millis(200));

    let value = client.invoke_async(request).await.unwrap();
    assert_ne!(value, format!("answered {primary_id}").into_bytes());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(client.pending().is_empty());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn server_stream_yields_every_frame() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp));

    let request = client.new_request("/count", InvokeMode::ServerStream, "4");
    let items: Vec<_> = client
        .invoke_server_stream(request)
        .await
        .unwrap()
        .collect()
        .await;

    let expected: Vec<Result<bytes::Bytes, RpcError>> = ["0", "1", "2", "3"]
        .into_iter()
        .map(|item| Ok(bytes::Bytes::from(item)))
        .collect();
    assert_eq!(items, expected);
    assert!(client.pending().is_empty());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn client_stream_is_reduced_to_one_reply() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp));

    let request = client.new_request("/sum", InvokeMode::ClientStream, "1");
    let (mut requests, responses) = client.invoke_client_stream(request).await.unwrap().split();
    requests.send("2").await.unwrap();
    requests.send("3").await.unwrap();
    requests.finish().await.unwrap();

    let items: Vec<_> = responses.collect().await;
    assert_eq!(items, vec![Ok(bytes::Bytes::from("6"))]);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn duplex_stream_answers_each_frame() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp));

    let request = client.new_request("/upper", InvokeMode::DuplexStream, "a");
    let call = match client.invoke(request).await.unwrap() {
        CallOutcome::Stream(call) => call,
        _ => panic!("duplex calls open a stream"),
    };

    let (mut requests, mut responses) = call.split();
    assert_eq!(responses.next().await, Some(Ok(bytes::Bytes::from("A"))));
    requests.send("b").await.unwrap();
    assert_eq!(responses.next().await, Some(Ok(bytes::Bytes::from("B"))));
    requests.send("c").await.unwrap();
    assert_eq!(responses.next().await, Some(Ok(bytes::Bytes::from("C"))));
    requests.finish().await.unwrap();
    assert_eq!(responses.next().await, None);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unknown_stream_method_ends_with_an_error() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp));

    let request = client.new_request("/nowhere", InvokeMode::ServerStream, "");
    let items: Vec<_> = client
        .invoke_server_stream(request)
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert!(matches!(&items[0], Err(RpcError::Remote(err)) if err.code == RemoteError::NOT_FOUND));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn connections_close_after_each_call_without_keep_alive() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp).with_keep_alive(false));

    for _ in 0..3 {
        let request = client.new_request("/ping", InvokeMode::Async, "ping");
        assert_eq!(client.invoke_async(request).await.unwrap().as_ref(), b"pong");
    }

    assert!(eventually(|| client.transport().connections().is_empty()).await);
    assert!(eventually(|| server.channels().is_empty()).await);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn idle_server_connections_are_closed() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp).with_idle_timeout(150));
    let client = client_for(&server, private_config(Network::Tcp));

    let request = client.new_request("/ping", InvokeMode::Async, "ping");
    assert_eq!(client.invoke_async(request).await.unwrap().as_ref(), b"pong");
    assert_eq!(server.channels().len(), 1);

    assert!(eventually(|| server.channels().is_empty()).await);
    assert!(eventually(|| client.transport().connections().is_empty()).await);

    // the pool drops the dead connection and dials again
    let request = client.new_request("/ping", InvokeMode::Async, "ping");
    assert_eq!(client.invoke_async(request).await.unwrap().as_ref(), b"pong");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn binding_a_taken_port_fails() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let taken = private_config(Network::Tcp).with_addr(server.local_addr());

    match RpcServer::open(taken, codec(), TestService::default()) {
        Err(RpcError::Bind(_)) => {}
        Err(err) => panic!("unexpected error: {err:?}"),
        Ok(_) => panic!("bound a port that is in use"),
    }

    server.close().await;
}

#[tokio::test]
async fn connecting_to_nobody_fails() {
    strand_logging::setup_log();
    let vacant = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let client = RpcClient::new(private_config(Network::Tcp).with_addr(vacant), codec()).unwrap();
    let request = client.new_request("/ping", InvokeMode::Async, "ping");
    assert!(matches!(
        client.invoke_async(request).await,
        Err(RpcError::Connect(_))
    ));

    client.close().await;
}

#[tokio::test]
async fn closing_the_server_fails_pending_calls() {
    strand_logging::setup_log();
    let (server, _) = serve(private_config(Network::Tcp));
    let client = client_for(&server, private_config(Network::Tcp));

    let request = client.new_request("/slow", InvokeMode::Async, "");
    let call = client.invoke_async(request);
    let close = async {
        strand_io::tokio::time::sleep(Duration::from_millis(100)).await;
        server.close().await;
    };

    let (result, _) = futures::future::join(call, close).await;
    assert_eq!(result, Err(RpcError::ConnectionClosed));
    assert!(client.pending().is_empty());

    client.close().await;
}
